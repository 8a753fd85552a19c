#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;

use super::*;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

#[test]
fn defaults_follow_the_target_config() {
    let options = parse_options(&args(&["main.mir"])).unwrap();
    assert_eq!(options.inputs, vec![PathBuf::from("main.mir")]);
    assert_eq!(options.config, TargetConfig::default());
    assert_eq!(options.passes, None);
    assert_eq!(options.output, None);
    assert_eq!(options.color, ColorMode::Auto);
}

#[test]
fn every_option_is_recognised() {
    let options = parse_options(&args(&[
        "a.mir",
        "--scheduler=coroutines",
        "--pointer-size=8",
        "--stack-size=4096",
        "--chain-limit=5",
        "--passes=interface, dce",
        "-o",
        "out.mir",
        "--emit-roots=roots.bin",
        "--color=never",
        "b.mir",
    ]))
    .unwrap();
    assert_eq!(options.inputs, vec![PathBuf::from("a.mir"), PathBuf::from("b.mir")]);
    assert_eq!(
        options.config,
        TargetConfig {
            pointer_size: 8,
            scheduler: Scheduler::Coroutines,
            task_stack_size: 4096,
            chain_limit: 5,
        }
    );
    assert_eq!(
        options.passes,
        Some(vec!["interface".to_owned(), "dce".to_owned()])
    );
    assert_eq!(options.output, Some(PathBuf::from("out.mir")));
    assert_eq!(options.emit_roots, Some(PathBuf::from("roots.bin")));
    assert_eq!(options.color, ColorMode::Never);
}

#[test]
fn bad_values_are_rejected() {
    let err = parse_options(&args(&["a.mir", "--scheduler=threads"])).unwrap_err();
    assert!(matches!(err, OptionError::BadValue { option: "--scheduler", .. }), "{err}");

    let err = parse_options(&args(&["a.mir", "--pointer-size=2"])).unwrap_err();
    assert_eq!(err.to_string(), "option `--pointer-size` expects 4 or 8, found `2`");

    let err = parse_options(&args(&["a.mir", "--stack-size=big"])).unwrap_err();
    assert!(matches!(err, OptionError::BadValue { option: "--stack-size", .. }), "{err}");
}

#[test]
fn malformed_command_lines() {
    assert_eq!(
        parse_options(&args(&["a.mir", "--fast"])).unwrap_err(),
        OptionError::Unknown("--fast".into())
    );
    assert_eq!(
        parse_options(&args(&["a.mir", "-o"])).unwrap_err(),
        OptionError::MissingValue("-o")
    );
    assert_eq!(parse_options(&args(&["--scheduler=tasks"])).unwrap_err(), OptionError::NoInputs);
}

#[test]
fn option_errors_are_invalid_option_diagnostics() {
    let diagnostic = OptionError::NoInputs.to_diagnostic();
    assert_eq!(diagnostic.code, ErrorCode::E0004);
    assert_eq!(diagnostic.message, "no input files");
}
