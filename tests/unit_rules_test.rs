use supfleet::core::rules::{
    ConciliationStrategy, NodeScope, RulesFile, StartStrategy, StartingFailureStrategy,
    parse_strategy,
};
use supfleet::core::SupfleetError;

const RULES: &str = r##"
[application.web]
start_sequence = 1
starting_failure_strategy = "STOP"

[application.web.process.front]
start_sequence = 1
required = true
expected_loading = 25
nodes = ["n1", "n2"]

[application.web.process.worker]
start_sequence = 2
wait_exit = true
nodes = ["#"]
running_failure_strategy = "RESTART_PROCESS"
"##;

#[test]
fn test_parse_application_rules() {
    let rules = RulesFile::from_toml(RULES).unwrap();
    let app = rules.application_rules("web");
    assert_eq!(app.start_sequence, 1);
    assert!(app.autostart());
    assert_eq!(
        app.starting_failure_strategy,
        StartingFailureStrategy::Stop
    );
}

#[test]
fn test_parse_process_rules() {
    let rules = RulesFile::from_toml(RULES).unwrap();
    let front = rules.process_rules("web", "front");
    assert_eq!(front.start_sequence, 1);
    assert!(front.required);
    assert_eq!(front.expected_loading, 25);
    assert_eq!(
        front.scope,
        NodeScope::List(vec!["n1".to_string(), "n2".to_string()])
    );

    let worker = rules.process_rules("web", "worker");
    assert!(worker.wait_exit);
    assert_eq!(worker.scope, NodeScope::Striped);
}

#[test]
fn test_unknown_entries_fall_back_to_defaults() {
    let rules = RulesFile::from_toml(RULES).unwrap();
    let unknown = rules.process_rules("web", "other");
    assert_eq!(unknown.start_sequence, -1);
    assert!(!unknown.required);
    assert_eq!(unknown.scope, NodeScope::All);

    let app = rules.application_rules("nothing");
    assert!(!app.autostart());
}

#[test]
fn test_loading_out_of_range_is_rejected() {
    let bad = r#"
[application.a.process.p]
expected_loading = 150
"#;
    let err = RulesFile::from_toml(bad).unwrap_err();
    assert!(matches!(err, SupfleetError::Rules(_)));
}

#[test]
fn test_malformed_toml_is_rejected() {
    assert!(RulesFile::from_toml("not [ toml").is_err());
}

#[test]
fn test_strategy_string_tables() {
    assert_eq!(parse_strategy("CONFIG").unwrap(), StartStrategy::Config);
    assert_eq!(
        parse_strategy("LESS_LOADED").unwrap(),
        StartStrategy::LessLoaded
    );
    assert_eq!(
        parse_strategy("MOST_LOADED").unwrap(),
        StartStrategy::MostLoaded
    );
    assert_eq!(StartStrategy::LessLoaded.to_string(), "LESS_LOADED");
    assert_eq!(ConciliationStrategy::Senicide.to_string(), "SENICIDE");
}

#[test]
fn test_unknown_strategy_is_a_bad_strategy_fault() {
    let err = parse_strategy("RANDOM").unwrap_err();
    assert!(matches!(err, SupfleetError::BadStrategy(_)));
    assert_eq!(err.code(), 103);
}

#[test]
fn test_process_rules_serial_form() {
    let rules = RulesFile::from_toml(RULES).unwrap();
    let serial = rules.process_rules("web", "worker").serial("web:worker");
    assert_eq!(serial["namespec"], "web:worker");
    assert_eq!(serial["addresses"][0], "#");
    assert_eq!(serial["running_failure_strategy"], "RESTART_PROCESS");
}
