//! Shared fixtures: a bare upstream repository on disk and a service
//! wired to an in-memory registry.

#![allow(dead_code)]

use repo_sandbox::config::Config;
use repo_sandbox::registry::{MemoryRegistry, RepositoryRecord, UserProfile};
use repo_sandbox::service::RepoService;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub const OWNER: &str = "alice";
pub const STRANGER: &str = "bob";

/// Run git in `dir` with a fixed identity, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Fixture", "-c", "user.email=fixture@example.com"])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("git should be installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Bare repository with one commit on `main`: README.md and src/lib.rs.
pub fn make_upstream(base: &Path) -> PathBuf {
    let work = base.join("seed-work");
    std::fs::create_dir_all(work.join("src")).unwrap();
    git(&work, &["init", "-q"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(work.join("README.md"), "# widgets\n").unwrap();
    std::fs::write(work.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
    git(&work, &["add", "."]);
    git(&work, &["commit", "-q", "-m", "Initial commit"]);

    let upstream = base.join("upstream.git");
    git(base, &["clone", "-q", "--bare", "seed-work", "upstream.git"]);
    upstream
}

pub struct Fixture {
    pub dir: TempDir,
    pub upstream: PathBuf,
    pub repos_root: PathBuf,
    pub registry: Arc<MemoryRegistry>,
    pub repo_id: Uuid,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let upstream = make_upstream(dir.path());
        let repos_root = dir.path().join("repos");
        std::fs::create_dir_all(&repos_root).unwrap();

        let registry = Arc::new(MemoryRegistry::new());
        let record = RepositoryRecord::new(
            OWNER,
            "widgets",
            format!("file://{}", upstream.display()),
        );
        let repo_id = record.id;
        registry.insert_repository(record).await;
        registry
            .insert_user(
                OWNER,
                UserProfile {
                    name: Some("Alice".to_string()),
                    email: Some("alice@example.com".to_string()),
                },
            )
            .await;

        Self {
            dir,
            upstream,
            repos_root,
            registry,
            repo_id,
        }
    }

    pub fn config(&self) -> Config {
        Config::new(&self.repos_root)
    }

    pub fn service(&self) -> RepoService {
        RepoService::new(Arc::new(self.config()), self.registry.clone())
    }

    pub fn clone_path(&self) -> PathBuf {
        self.repos_root.join(OWNER).join("widgets")
    }
}
