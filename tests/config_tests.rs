use armada::armada::config::{ConfigError, MissionConfig, TaskGraph, TaskSpec};

fn task(name: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        objective: format!("{} objective", name),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        agents: None,
        iterator: None,
        output: None,
    }
}

const FULL_CONFIG: &str = r#"{
    "variables": [
        {"name": "region", "default": "eu"},
        {"name": "api_token", "secret": true, "default": "tok-123"}
    ],
    "models": [
        {"name": "fast", "provider": "openai", "allowed_models": ["gpt-4o-mini"], "api_key": "k"}
    ],
    "tools": [
        {
            "name": "web_search",
            "implements": "browser/search",
            "description": "Search the web.",
            "inputs": [{"name": "query", "type": "string", "required": true}]
        }
    ],
    "plugins": [
        {"name": "browser", "source": "registry://browser", "version": "1.2.0"}
    ],
    "agents": [
        {
            "name": "scout",
            "model": "fast",
            "role": "Finds sources",
            "tools": ["web_search"],
            "single_tool_limit": 3,
            "turn_limit": 12,
            "compaction": {"token_limit": 64000, "turn_retention": 4}
        }
    ],
    "missions": [
        {
            "name": "survey",
            "supervisor_model": "fast",
            "agents": ["scout"],
            "inputs": [
                {"name": "topic", "type": "string"},
                {"name": "depth", "type": "integer", "default": "2"}
            ],
            "datasets": [
                {
                    "name": "sources",
                    "schema": [{"name": "url", "type": "string", "required": true}],
                    "items": [{"url": "https://example.com"}]
                }
            ],
            "tasks": [
                {"name": "collect", "objective": "collect sources on {{inputs.topic}}"},
                {
                    "name": "summarise",
                    "objective": "summarise {{item.url}}",
                    "depends_on": ["collect"],
                    "iterator": {"dataset": "sources", "parallel": false, "max_retries": 1},
                    "output": [{"name": "summary", "type": "string", "required": true}]
                }
            ]
        }
    ]
}"#;

#[test]
fn a_full_config_parses_and_validates() {
    let config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    config.validate().unwrap();

    let agent = config.find_agent("scout").unwrap();
    assert_eq!(agent.model, "fast");
    assert_eq!(agent.single_tool_limit, Some(3));
    assert_eq!(agent.all_tool_limit, None);
    assert_eq!(agent.compaction.as_ref().unwrap().turn_retention, 4);

    let mission = config.find_mission("survey").unwrap();
    assert_eq!(mission.tasks.len(), 2);
    let iterator = mission.tasks[1].iterator.as_ref().unwrap();
    assert!(!iterator.parallel);
    assert_eq!(iterator.max_retries, 1);
    assert_eq!(iterator.concurrency_limit, None);

    // Secret variables are masked in the template map but available as
    // secrets.
    assert_eq!(config.variable_map()["api_token"], "********");
    assert_eq!(config.variable_map()["region"], "eu");
    assert_eq!(config.secret_map()["api_token"], "tok-123");
}

#[test]
fn unknown_references_are_rejected() {
    let mut config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    config.agents[0].model = "nonexistent".to_string();
    match config.validate() {
        Err(ConfigError::UnknownReference { kind, name, .. }) => {
            assert_eq!(kind, "model");
            assert_eq!(name, "nonexistent");
        }
        other => panic!("expected unknown model reference, got {:?}", other),
    }

    let mut config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    config.agents[0].tools.push("ghost_tool".to_string());
    assert!(matches!(
        config.validate(),
        Err(ConfigError::UnknownReference { kind: "tool", .. })
    ));

    let mut config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    config.missions[0].tasks[1].iterator.as_mut().unwrap().dataset = "nope".to_string();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::UnknownReference { kind: "dataset", .. })
    ));
}

#[test]
fn duplicate_names_are_rejected() {
    let mut config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    let duplicate = config.missions[0].tasks[0].clone();
    config.missions[0].tasks.push(duplicate);
    assert!(matches!(
        config.validate(),
        Err(ConfigError::DuplicateName { kind: "task", .. })
    ));
}

#[test]
fn cycles_are_a_config_time_refusal() {
    let mut config = MissionConfig::from_json_str(FULL_CONFIG).unwrap();
    config.missions[0].tasks[0]
        .depends_on
        .push("summarise".to_string());
    match config.validate() {
        Err(ConfigError::DependencyCycle(tasks)) => {
            assert!(tasks.contains(&"collect".to_string()));
            assert!(tasks.contains(&"summarise".to_string()));
        }
        other => panic!("expected a cycle refusal, got {:?}", other),
    }
}

#[test]
fn topological_order_breaks_ties_by_declaration_order() {
    // b and c are both ready once a completes; declaration order wins.
    let tasks = vec![
        task("a", &[]),
        task("c", &["a"]),
        task("b", &["a"]),
        task("d", &["b", "c"]),
    ];
    let graph = TaskGraph::build(&tasks).unwrap();
    let order: Vec<&str> = graph
        .topo_order()
        .unwrap()
        .into_iter()
        .map(|id| graph.name(id))
        .collect();
    assert_eq!(order, vec!["a", "c", "b", "d"]);
}

#[test]
fn dependency_chains_walk_bfs_and_deduplicate() {
    let tasks = vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
    ];
    let graph = TaskGraph::build(&tasks).unwrap();
    let chain: Vec<&str> = graph
        .dependency_chain(3)
        .into_iter()
        .map(|id| graph.name(id))
        .collect();
    // Direct deps first in declared order, then their shared ancestor
    // exactly once.
    assert_eq!(chain, vec!["b", "c", "a"]);
    assert!(graph.dependency_chain(0).is_empty());
}

#[test]
fn unknown_dependency_names_fail_graph_construction() {
    let tasks = vec![task("a", &["missing"])];
    assert!(matches!(
        TaskGraph::build(&tasks),
        Err(ConfigError::UnknownReference { kind: "task", .. })
    ));
}
