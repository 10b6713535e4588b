use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_cache: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_cache = base.join("xdg-cache");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(xdg_config.join("stowaway")).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_cache).expect("failed to create XDG_CACHE_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_config,
            xdg_cache,
            xdg_state,
        }
    }

    fn write_config(&self, endpoint: &str) {
        let config = format!(
            "[dispatch]\nendpoint = \"{}\"\ntimeout_ms = 500\n",
            endpoint
        );
        fs::write(self.xdg_config.join("stowaway/config.toml"), config)
            .expect("failed to write config");
    }

    fn cache_host_dir(&self) -> PathBuf {
        self.xdg_cache.join("stowaway/127.0.0.1")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("stowaway"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_CACHE_HOME", &env.xdg_cache)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute stowaway: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "stowaway {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn container_count(env: &CliTestEnv) -> usize {
    match fs::read_dir(env.cache_host_dir()) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[test]
fn status_without_config_reports_not_ready() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Stowaway Configuration"));
    assert!(stdout.contains("Endpoint:        <not set>"));
    assert!(stdout.contains("Status: Not ready"));
}

#[test]
fn send_without_endpoint_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["send", "?idsite=1&rec=1"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to create dispatcher"));
}

#[test]
fn unreachable_collector_keeps_records_for_flush() {
    let env = CliTestEnv::new();
    env.write_config("http://127.0.0.1:9/matomo.php");

    let args = ["send", "?idsite=1&rec=1", "?idsite=1&rec=2"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Delivered:       0 record(s)"));
    assert!(stdout.contains("run 'flush'"));
    assert_eq!(container_count(&env), 1, "records should be cached on exit");

    let status = run_bin(&env, &["status"]);
    assert_success(&["status"], &status);
    let status_stdout = String::from_utf8_lossy(&status.stdout);
    assert!(status_stdout.contains("Containers:      1"));
    assert!(status_stdout.contains("Status: Ready to dispatch"));
}

#[tokio::test(flavor = "multi_thread")]
async fn send_and_flush_deliver_to_collector() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/matomo.php"))
        .and(query_param("idsite", "1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/matomo.php"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = CliTestEnv::new();
    let endpoint = format!("{}/matomo.php", server.uri());
    env.write_config(&endpoint);

    let args = ["send", "idsite=1&action_name=Home"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Delivered:       1 record(s)"));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].url.query(),
        Some("idsite=1&action_name=Home")
    );

    // Nothing cached, so flush has nothing to do.
    let output = run_bin(&env, &["flush"]);
    assert_success(&["flush"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Nothing to flush."));
    assert_eq!(container_count(&env), 0);
}
