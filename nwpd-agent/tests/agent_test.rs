use nwpd_agent::{Agent, AgentOptions};
use nwpd_proto::GetObservationsRequest;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn agent_config(data_dir: &Path, job_id: &str, port: u16) -> String {
    format!(
        r#"
outputDir: {}
logObservations: true
podNetwork:
  defaultPeriod: 100ms
  jobs:
    - jobID: {}
      args: ["checkTCPPort", "--endpoints", "local:127.0.0.1:{}"]
"#,
        data_dir.display(),
        job_id,
        port
    )
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_probes_reloads_and_stops() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((_socket, _)) = listener.accept().await {}
    });

    let config_dir = dir.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    let agent_file = config_dir.join("agent.yaml");
    let cluster_file = config_dir.join("cluster.yaml");
    let data_dir = dir.path().join("data");
    std::fs::write(&agent_file, agent_config(&data_dir, "tcp-local", port)).unwrap();
    std::fs::write(&cluster_file, "nodeCount: 0\n").unwrap();

    let mut options = AgentOptions::new(&agent_file, &cluster_file);
    options.node_name = "node-a".to_string();
    options.tick_period = Duration::from_millis(10);
    options.log_dir = dir.path().join("log");

    let agent = Agent::setup(options).await.unwrap();
    let manager = agent.manager();
    let service = agent.service();
    let shutdown = agent.shutdown_token();
    assert_eq!(manager.registry().job_ids().await, vec!["tcp-local"]);

    let handle = tokio::spawn(agent.run());

    let stored = wait_for(|| {
        let service = service.clone();
        async move {
            service
                .list_observations(&GetObservationsRequest::default())
                .await
                .map(|obs| obs.len() >= 2)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(stored, "no observations were stored");

    let observations = service
        .list_observations(&GetObservationsRequest::default())
        .await
        .unwrap();
    assert!(observations.iter().all(|o| o.src_host == "node-a"));
    assert!(observations.iter().all(|o| o.dest_host == "local"));
    assert!(observations.iter().all(|o| o.ok));

    std::fs::write(&agent_file, agent_config(&data_dir, "tcp-renamed", port)).unwrap();
    let reloaded = wait_for(|| {
        let manager = manager.clone();
        async move { manager.registry().job_ids().await == vec!["tcp-renamed"] }
    })
    .await;
    assert!(reloaded, "config change was not applied");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("agent did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_setup_fails_on_invalid_job() {
    let dir = TempDir::new().unwrap();
    let agent_file = dir.path().join("agent.yaml");
    let cluster_file = dir.path().join("cluster.yaml");
    std::fs::write(
        &agent_file,
        "podNetwork:\n  jobs:\n    - jobID: broken\n      args: [\"pingEverything\"]\n",
    )
    .unwrap();
    std::fs::write(&cluster_file, "nodeCount: 0\n").unwrap();

    let mut options = AgentOptions::new(&agent_file, &cluster_file);
    options.log_dir = dir.path().join("log");

    let err = Agent::setup(options).await.err().unwrap();
    assert!(err.to_string().contains("broken"));
}

#[tokio::test]
async fn test_setup_fails_on_zero_report_period() {
    let dir = TempDir::new().unwrap();
    let agent_file = dir.path().join("agent.yaml");
    let cluster_file = dir.path().join("cluster.yaml");
    std::fs::write(&agent_file, "aggregationReportPeriodSeconds: 0\n").unwrap();
    std::fs::write(&cluster_file, "nodeCount: 0\n").unwrap();

    let mut options = AgentOptions::new(&agent_file, &cluster_file);
    options.log_dir = dir.path().join("log");

    let err = Agent::setup(options).await.err().unwrap();
    assert!(err.to_string().contains("aggregationReportPeriodSeconds"));
}
