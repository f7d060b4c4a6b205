// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;

use super::filter_directives;

#[rstest]
#[case(0, None, None, "arcfs=info,warn")]
#[case(0, Some("arcfs=error"), None, "arcfs=error")]
#[case(1, Some("arcfs=error"), None, "arcfs=debug,info")]
#[case(2, None, None, "arcfs=trace,info")]
#[case(3, None, None, "arcfs=trace,debug")]
#[case(7, None, None, "trace")]
#[case(1, None, Some("fuser=warn"), "arcfs=debug,info,fuser=warn")]
#[case(0, None, Some(""), "arcfs=info,warn")]
fn test_filter_directives(
    #[case] verbosity: usize,
    #[case] arcfs_log: Option<&str>,
    #[case] rust_log: Option<&str>,
    #[case] expected: &str,
) {
    let actual = filter_directives(
        verbosity,
        arcfs_log.map(String::from),
        rust_log.map(String::from),
    );
    assert_eq!(actual, expected);
}
