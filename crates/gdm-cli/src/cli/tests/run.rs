//! Tests for the run subcommand.

use super::parse;
use crate::cli::{Cli, CliCommand};
use clap::Parser;
use std::path::Path;

#[test]
fn cli_parse_run_urls() {
    match parse(&["gdm", "run", "https://example.com/a", "https://example.com/b"]) {
        CliCommand::Run {
            urls,
            input,
            dir,
            jobs,
            local_only,
        } => {
            assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
            assert!(input.is_none());
            assert!(dir.is_none());
            assert!(jobs.is_none());
            assert!(!local_only);
        }
        _ => panic!("expected Run"),
    }
}

#[test]
fn cli_parse_run_options() {
    match parse(&[
        "gdm",
        "run",
        "--input",
        "list.txt",
        "--dir",
        "/tmp/out",
        "--jobs",
        "3",
        "--local-only",
    ]) {
        CliCommand::Run {
            urls,
            input,
            dir,
            jobs,
            local_only,
        } => {
            assert!(urls.is_empty());
            assert_eq!(input.as_deref(), Some(Path::new("list.txt")));
            assert_eq!(dir.as_deref(), Some(Path::new("/tmp/out")));
            assert_eq!(jobs, Some(3));
            assert!(local_only);
        }
        _ => panic!("expected Run with options"),
    }
}

#[test]
fn cli_parse_run_short_flags() {
    match parse(&["gdm", "run", "-j", "2", "-d", "out", "https://example.com/x"]) {
        CliCommand::Run { urls, dir, jobs, .. } => {
            assert_eq!(urls, vec!["https://example.com/x"]);
            assert_eq!(dir.as_deref(), Some(Path::new("out")));
            assert_eq!(jobs, Some(2));
        }
        _ => panic!("expected Run"),
    }
}

#[test]
fn cli_rejects_zero_jobs() {
    assert!(Cli::try_parse_from(["gdm", "run", "--jobs", "0", "u"]).is_err());
}
