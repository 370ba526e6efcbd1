use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use gavel_common::config::RedisConfig;
use gavel_common::diff::{self, DiffArgs};
use gavel_common::redis as store;
use gavel_common::types::{CaseRun, GroupRun, ProblemVersion, ProgramSource, SubmissionRun};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

async fn connect() -> Result<ConnectionManager> {
    let config = RedisConfig::from_env();
    let (_, conn) = config
        .connect()
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.url))?;
    Ok(conn)
}

/// Read source files into the stored program layout, keyed by file name.
pub fn encode_sources(paths: &[PathBuf]) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid source path {}", path.display()))?
            .to_string();
        let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        if files.insert(name.clone(), general_purpose::STANDARD.encode(contents)).is_some() {
            bail!("Two source files are named '{}'", name);
        }
    }
    Ok(files)
}

/// Queue a run of local source files
pub async fn submit(problem: i64, language: &str, submission: Option<i64>, paths: &[PathBuf]) -> Result<()> {
    println!("📤 Submitting {} file(s) to problem {}", paths.len(), problem);

    let files = encode_sources(paths)?;
    let mut conn = connect().await?;

    if store::get_problem(&mut conn, problem).await?.is_none() {
        bail!("Problem version {} not found", problem);
    }

    let program = ProgramSource {
        language: language.to_string(),
        files,
    };
    let run = store::queue_run(&mut conn, submission, problem, program)
        .await
        .context("Failed to queue run")?;

    println!("✅ Queued run {} (submission {})", run.id, run.submission_id);
    Ok(())
}

/// Queue a fresh run of an existing run's program
pub async fn rejudge(run_id: i64) -> Result<()> {
    println!("🔁 Rejudging run {}", run_id);

    let mut conn = connect().await?;
    match store::rejudge_run(&mut conn, run_id).await? {
        Some(run) => {
            println!("✅ Queued run {} (submission {})", run.id, run.submission_id);
            Ok(())
        }
        None => bail!("Run {} not found", run_id),
    }
}

pub fn render_run(run: &SubmissionRun, cases: &[CaseRun], groups: &[GroupRun]) -> String {
    let mut out = String::new();
    let verdict = run.verdict.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "Run {} (submission {}, problem {}, {})",
        run.id, run.submission_id, run.problem_version_id, run.program.language
    );
    let _ = writeln!(out, "  status:  {}", run.status);
    let _ = writeln!(out, "  verdict: {}", verdict);
    let _ = writeln!(out, "  score:   {}", run.score);
    let _ = writeln!(out, "  time:    {} ms", run.time_usage_ms);
    if let Some(message) = &run.compile_error {
        let _ = writeln!(out, "\nCompiler output:\n{}", message);
    }

    if !groups.is_empty() {
        let _ = writeln!(out, "\nGroups:");
        for g in groups {
            let _ = writeln!(
                out,
                "  #{:<6} {:<20} {:>8} {:>6} ms  {}",
                g.test_group_id,
                g.verdict.to_string(),
                g.score,
                g.time_usage_ms,
                if g.passed { "passed" } else { "failed" }
            );
        }
    }
    if !cases.is_empty() {
        let _ = writeln!(out, "\nCases:");
        for c in cases {
            let _ = writeln!(
                out,
                "  #{:<6} {:<20} {:>8} {:>6} ms",
                c.test_case_id,
                c.verdict.to_string(),
                c.score,
                c.time_usage_ms
            );
        }
    }
    out
}

/// Show a run and its result rows
pub async fn show(run_id: i64, json: bool) -> Result<()> {
    let mut conn = connect().await?;
    let Some(run) = store::get_run(&mut conn, run_id).await? else {
        bail!("Run {} not found", run_id);
    };
    let cases = store::get_case_runs(&mut conn, run_id).await?;
    let groups = store::get_group_runs(&mut conn, run_id).await?;

    if json {
        let body = serde_json::json!({ "run": run, "cases": cases, "groups": groups });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        print!("{}", render_run(&run, &cases, &groups));
    }
    Ok(())
}

pub fn load_problem(path: &Path) -> Result<ProblemVersion> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Store a problem version, warning about test data not uploaded yet
pub async fn put_problem(path: &Path) -> Result<()> {
    let problem = load_problem(path)?;
    println!("📝 Storing problem version {}", problem.id);

    let mut conn = connect().await?;
    let mut missing = Vec::new();
    for hash in problem.root_group.file_hashes() {
        let exists: bool = conn.exists(store::file_key(&hash)).await?;
        if !exists {
            missing.push(hash);
        }
    }

    store::put_problem(&mut conn, &problem)
        .await
        .context("Failed to store problem version")?;

    if !missing.is_empty() {
        println!("⚠️  {} test data file(s) are not uploaded yet:", missing.len());
        for hash in &missing {
            println!("  - {}", hash);
        }
    }
    println!("✅ Problem version {} stored", problem.id);
    Ok(())
}

pub fn content_hash(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

/// Upload a test data file under its content hash
pub async fn put_file(path: &Path) -> Result<()> {
    let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let hash = content_hash(&contents);

    let mut conn = connect().await?;
    store::put_file(&mut conn, &hash, &contents)
        .await
        .context("Failed to upload file")?;

    println!("✅ Stored {} ({} bytes)", path.display(), contents.len());
    println!("{}", hash);
    Ok(())
}

/// Diff two local files. Returns whether they match.
pub fn diff_files(reference: &Path, output: &Path, flags: &[String]) -> Result<bool> {
    let args = DiffArgs::from_flags(flags)?;
    let reference_text =
        fs::read_to_string(reference).with_context(|| format!("Failed to read {}", reference.display()))?;
    let output_text = fs::read_to_string(output).with_context(|| format!("Failed to read {}", output.display()))?;

    let result = diff::diff(&reference_text, &output_text, &args);
    if result.matched {
        println!("✅ Accepted");
    } else {
        println!("❌ Wrong answer: {}", result.description);
    }
    Ok(result.matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::{RunStatus, Verdict};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_encode_sources() {
        let dir = TempDir::new().unwrap();
        let main = write(&dir, "main.py", "print(1)");
        let files = encode_sources(&[main]).unwrap();
        assert_eq!(files.get("main.py").map(String::as_str), Some("cHJpbnQoMSk="));
    }

    #[test]
    fn test_encode_sources_rejects_duplicate_names() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let first = write(&a, "main.py", "1");
        let second = write(&b, "main.py", "2");
        assert!(encode_sources(&[first, second]).is_err());
    }

    #[test]
    fn test_load_problem() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "problem.json",
            r#"{
                "id": 7,
                "time_limit_ms": 1000,
                "memory_limit_kb": 262144,
                "root_group": {
                    "id": 1,
                    "name": "root",
                    "cases": [{"id": 1, "name": "a", "input_hash": "aa11", "output_hash": "bb22"}]
                }
            }"#,
        );
        let problem = load_problem(&path).unwrap();
        assert_eq!(problem.id, 7);
        assert_eq!(problem.root_group.file_hashes(), vec!["aa11", "bb22"]);

        let broken = write(&dir, "broken.json", "{");
        assert!(load_problem(&broken).is_err());
    }

    #[test]
    fn test_diff_files() {
        let dir = TempDir::new().unwrap();
        let reference = write(&dir, "ans", "Yes 0.5\n");
        let good = write(&dir, "out1", "yes   0.5");
        let bad = write(&dir, "out2", "no 0.5");
        assert!(diff_files(&reference, &good, &[]).unwrap());
        assert!(!diff_files(&reference, &bad, &[]).unwrap());
        assert!(!diff_files(&reference, &good, &["case_sensitive".to_string()]).unwrap());
        assert!(diff_files(&reference, &good, &["float_tolerance=x".to_string()]).is_err());
    }

    #[test]
    fn test_render_run() {
        let mut run = SubmissionRun::new(5, 2, 7, ProgramSource {
            language: "cpp".to_string(),
            files: BTreeMap::new(),
        });
        run.status = RunStatus::Done;
        run.verdict = Some(Verdict::WrongAnswer);
        let cases = vec![CaseRun {
            run_id: 5,
            test_case_id: 3,
            verdict: Verdict::WrongAnswer,
            score: 0.0,
            time_usage_ms: 12,
        }];
        let groups = vec![GroupRun {
            run_id: 5,
            test_group_id: 1,
            verdict: Verdict::WrongAnswer,
            score: 0.0,
            time_usage_ms: 12,
            passed: false,
        }];

        let text = render_run(&run, &cases, &groups);
        assert!(text.starts_with("Run 5 (submission 2, problem 7, cpp)"));
        assert!(text.contains("status:  done"));
        assert!(text.contains("verdict: wrong_answer"));
        assert!(text.contains("#3"));
        assert!(text.contains("failed"));
    }
}
