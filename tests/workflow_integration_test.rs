use adw_supervisor::config::workflow::Workflow;
use adw_supervisor::config::{ModelTier, OutputSpec, Provider};
use adw_supervisor::error::ConfigError;
use adw_supervisor::watchdog::DeploymentScope;

const EXAMPLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/workflows/example.toml");

fn example() -> Workflow {
    Workflow::from_file(EXAMPLE).expect("workflows/example.toml を読み込めません")
}

#[test]
fn test_example_workflow_loads() {
    let workflow = example();

    assert_eq!(workflow.name(), "feature-implementation");
    assert_eq!(workflow.version(), Some("1.0.0"));
    assert!(workflow.settings().fail_fast);
    assert_eq!(workflow.variables()["feature"], "ユーザー認証");
    assert_eq!(workflow.safety_rules().len(), 2);

    let ids: Vec<&str> = workflow.steps().iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec!["plan", "implement", "review"]);

    let [plan, implement, review] = workflow.steps() else {
        panic!("ステップ数が想定と異なります");
    };
    assert_eq!(plan.model_tier(), Some(ModelTier::Heavy));
    assert!(matches!(plan.output(), Some(OutputSpec::Variable { name }) if name == "plan"));
    assert_eq!(implement.retries(), Some(2));
    assert_eq!(implement.tool().map(|t| t.scope), Some(DeploymentScope::LocalService));
    assert_eq!(review.provider(), Provider::OpenAI);
    assert!(matches!(review.output(), Some(OutputSpec::File { .. })));

    assert_eq!(
        workflow.graph().waves(),
        vec![
            vec!["plan".to_string()],
            vec!["implement".to_string()],
            vec!["review".to_string()],
        ]
    );
}

#[test]
fn test_example_survives_save_and_reload() {
    let original = example();

    let restored = Workflow::from_toml(&original.to_string().expect("serialize")).expect("parse");
    assert_eq!(restored.steps(), original.steps());
    assert_eq!(restored.settings(), original.settings());
    assert_eq!(restored.variables(), original.variables());

    let dir = tempfile::tempdir().expect("tempdir");
    let saved = dir.path().join("saved.toml");
    original.to_file(&saved).expect("save");
    assert_eq!(Workflow::from_file(&saved).expect("reload").steps(), original.steps());
}

#[test]
fn test_forward_reference_is_rejected_at_load() {
    let err = Workflow::from_toml(
        r#"
[workflow]
name = "bad"

[[steps]]
id = "a"
prompt = "needs ${steps.b.output}"

[[steps]]
id = "b"
prompt = "later"
"#,
    )
    .unwrap_err();

    assert!(matches!(err, ConfigError::ForwardReference { .. }), "{err:?}");
}
