use std::fs;
use std::path::{Path, PathBuf};

/// Registry mutators and the only files allowed to call them
const REGISTRY_MUTATORS: &[(&str, &[&str])] = &[
    (".record_heartbeat(", &["src/platform/router.rs"]),
    (".apply_status(", &["src/platform/router.rs"]),
    (".merge_metrics(", &["src/platform/router.rs"]),
    (".record_error(", &["src/platform/router.rs"]),
    (".mark_timed_out(", &["src/supervisor/health_monitor.rs"]),
];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

/// Source up to the unit-test module; tests may drive the registry directly
fn non_test_source(content: &str) -> &str {
    match content.find("#[cfg(test)]") {
        Some(idx) => &content[..idx],
        None => content,
    }
}

#[test]
fn registry_mutations_are_limited_to_router_and_health_monitor() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let src_root = repo_root.join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);
    assert!(!files.is_empty(), "no sources found under {}", src_root.display());

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in non_test_source(&content).lines().enumerate() {
            let trimmed = line.trim();
            for (call, allowed) in REGISTRY_MUTATORS {
                if !trimmed.contains(call) {
                    continue;
                }
                if allowed.iter().any(|a| *a == rel) {
                    continue;
                }
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "agent registry mutated outside the router and health monitor:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn only_the_router_consumes_the_message_queue() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if rel == "src/platform/router.rs" || rel == "src/platform/queue.rs" {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in non_test_source(&content).lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains("MessageQueue::new(") || trimmed.contains(".dequeue(") {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "message queue used outside the router:\n{}",
        offenders.join("\n")
    );
}
