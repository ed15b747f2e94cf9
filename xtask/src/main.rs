use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "nkata-server";

type TaskResult = Result<(), String>;

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Nkata workspace")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Check formatting and run clippy with every feature enabled")]
    Lint,
    #[command(about = "Execute `cargo test --workspace --all-features`")]
    Test,
    #[command(about = "Run lint then test")]
    Ci,
    #[command(about = "Boot the server, call the history API with an issued token, scrape `/metrics`")]
    Smoke,
}

fn main() {
    let cli = Cli::parse();
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let outcome = match cli.command {
        Task::Fmt => cargo(&root, &["fmt", "--all"]),
        Task::Lint => lint(&root),
        Task::Test => test(&root),
        Task::Ci => lint(&root).and_then(|()| test(&root)),
        Task::Smoke => smoke(&root),
    };

    if let Err(message) = outcome {
        eprintln!("xtask failed: {message}");
        exit(1);
    }
}

fn lint(root: &Path) -> TaskResult {
    cargo(root, &["fmt", "--all", "--", "--check"])?;
    cargo(
        root,
        &["clippy", "--workspace", "--all-features", "--", "-D", "warnings"],
    )
}

fn test(root: &Path) -> TaskResult {
    cargo(root, &["test", "--workspace", "--all-features"])
}

fn cargo(root: &Path, args: &[&str]) -> TaskResult {
    let status = Command::new("cargo")
        .args(args)
        .current_dir(root)
        .status()
        .map_err(|err| format!("failed to spawn cargo: {err}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("`cargo {}` exited with {status}", args.join(" ")))
    }
}

fn server(root: &Path) -> Command {
    let mut command = Command::new("cargo");
    command
        .args(["run", "--quiet", "--features", "metrics", "-p", SERVER_PACKAGE, "--"])
        .current_dir(root);
    command
}

/// Run a one-shot server subcommand and capture its stdout.
fn server_output(root: &Path, args: &[&str]) -> Result<String, String> {
    let output = server(root)
        .args(args)
        .stderr(Stdio::inherit())
        .output()
        .map_err(|err| format!("failed to run {SERVER_PACKAGE}: {err}"))?;
    if !output.status.success() {
        return Err(format!(
            "`{SERVER_PACKAGE} {}` exited with {}",
            args.join(" "),
            output.status
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if stdout.is_empty() {
        return Err(format!("`{SERVER_PACKAGE} {}` printed nothing", args.join(" ")));
    }
    Ok(stdout)
}

/// Kills the server process when dropped.
struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Err(err) = self.0.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                eprintln!("failed to stop {SERVER_PACKAGE}: {err}");
            }
        }
        let _ = self.0.wait();
    }
}

fn smoke(root: &Path) -> TaskResult {
    cargo(root, &["build", "--features", "metrics", "-p", SERVER_PACKAGE])?;

    let signing_key = server_output(root, &["generate-signing-key"])?;
    let token = server_output(
        root,
        &[
            "--signing-key",
            &signing_key,
            "issue-token",
            "--username",
            "smoke",
            "--ttl-minutes",
            "5",
        ],
    )?;

    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|err| format!("failed to reserve a free port: {err}"))?;
    let bind_addr = format!("127.0.0.1:{port}");

    let _server = server(root)
        .args([
            "--bind-addr",
            &bind_addr,
            "--metrics-enabled",
            "true",
            "--signing-key",
            &signing_key,
        ])
        .env("RUST_LOG", "warn")
        .spawn()
        .map(ServerProcess)
        .map_err(|err| format!("failed to launch {SERVER_PACKAGE}: {err}"))?;

    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|err| format!("failed to build HTTP client: {err}"))?;
    let base = format!("http://{bind_addr}");

    wait_until_ready(&client, &format!("{base}/ready"), Duration::from_secs(30))?;
    check_history(&client, &format!("{base}/v1/conversations/smoke/messages"), &token)?;
    check_metrics(&client, &format!("{base}/metrics"))?;
    println!("smoke test passed against {base}");
    Ok(())
}

fn wait_until_ready(client: &Client, url: &str, within: Duration) -> TaskResult {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if matches!(client.get(url).send(), Ok(response) if response.status().is_success()) {
            return Ok(());
        }
        sleep(Duration::from_millis(500));
    }
    Err(format!("{url} did not become ready within {within:?}"))
}

fn check_history(client: &Client, url: &str, token: &str) -> TaskResult {
    let anonymous = client
        .get(url)
        .send()
        .map_err(|err| format!("history request failed: {err}"))?;
    if anonymous.status() != StatusCode::UNAUTHORIZED {
        return Err(format!(
            "history without a token returned {}, expected 401",
            anonymous.status()
        ));
    }

    let response = client
        .get(url)
        .bearer_auth(token)
        .send()
        .map_err(|err| format!("history request failed: {err}"))?;
    if response.status() != StatusCode::OK {
        return Err(format!("history returned {}", response.status()));
    }
    let page: Value = response
        .json()
        .map_err(|err| format!("history page is not JSON: {err}"))?;
    if page["total_count"].is_i64() && page["data"].is_array() {
        Ok(())
    } else {
        Err(format!("history page has an unexpected shape: {page}"))
    }
}

fn check_metrics(client: &Client, url: &str) -> TaskResult {
    let response = client
        .get(url)
        .send()
        .map_err(|err| format!("metrics request failed: {err}"))?;
    if response.status() != StatusCode::OK {
        return Err(format!("metrics returned {}", response.status()));
    }
    let body = response
        .text()
        .map_err(|err| format!("failed to read metrics body: {err}"))?;
    if body.contains("nkata_http_requests_total") {
        Ok(())
    } else {
        Err("metrics output is missing nkata_http_requests_total".into())
    }
}
