use flowir::driver::config::{Config, ConfigError, OptLevel, OptimizerSettings};
use test_case::test_case;

#[test_case(OptLevel::None, false, false, false; "none")]
#[test_case(OptLevel::Less, true, false, false; "less")]
#[test_case(OptLevel::Default, true, true, false; "default")]
#[test_case(OptLevel::Aggressive, true, true, true; "aggressive")]
fn presets_enable_passes(level: OptLevel, fold: bool, dataflow: bool, unroll: bool) {
    let settings = OptimizerSettings::for_level(level);
    assert_eq!(settings.constant_fold, fold);
    assert_eq!(settings.flatten_nested, fold);
    assert_eq!(settings.forward_dataflow, dataflow);
    assert_eq!(settings.make_immediate, dataflow);
    assert_eq!(settings.loop_unroll, unroll);
}

#[test]
fn empty_config_uses_default_level() {
    let config: Config = "".parse().unwrap();
    assert_eq!(config.opt_level, OptLevel::Default);
    assert_eq!(config.settings(), OptimizerSettings::default());
}

#[test]
fn optimizer_table_overrides_level() {
    let config: Config = r#"
        opt_level = "none"

        [optimizer]
        loop_unroll = true
        max_unroll = 4
    "#
    .parse()
    .unwrap();

    let settings = config.settings();
    assert!(settings.loop_unroll);
    assert_eq!(settings.max_unroll, 4);
    // Knobs missing from the table keep the level's preset.
    assert!(!settings.constant_fold);
    assert_eq!(settings.opt_passes, 1);
}

#[test]
fn optimizer_table_keeps_aggressive_unrolling() {
    let config: Config = r#"
        opt_level = "aggressive"

        [optimizer]
        max_unroll = 4
    "#
    .parse()
    .unwrap();

    let settings = config.settings();
    assert!(settings.loop_unroll);
    assert_eq!(
        settings,
        OptimizerSettings {
            max_unroll: 4,
            ..OptimizerSettings::for_level(OptLevel::Aggressive)
        }
    );
}

#[test]
fn loads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowir.toml");
    std::fs::write(&path, "opt_level = \"aggressive\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.settings(), OptimizerSettings::for_level(OptLevel::Aggressive));
}

#[test]
fn reports_bad_configs() {
    let dir = tempfile::tempdir().unwrap();
    let missing = Config::load(dir.path().join("missing.toml"));
    assert!(matches!(missing, Err(ConfigError::Io { .. })));

    let invalid = "opt_level = \"fastest\"".parse::<Config>();
    assert!(matches!(invalid, Err(ConfigError::Toml(_))));
}
