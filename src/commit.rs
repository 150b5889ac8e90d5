use crate::clean;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::process::Command;

/// Diffs are capped before prompting so oversized change sets do not blow the
/// request budget.
pub const MAX_DIFF_CHARS: usize = 6000;

const MAX_SUBJECT_CHARS: usize = 72;
const MAX_UNTRACKED_FILES: usize = 10;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct GitStatus {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub untracked: Vec<String>,
}

impl GitStatus {
    pub fn has_changes(&self) -> bool {
        !(self.modified.is_empty()
            && self.added.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
            && self.untracked.is_empty())
    }
}

/// Parse `git status --porcelain` output. A file counts once per bucket even
/// when it is both staged and unstaged.
pub fn parse_porcelain(out: &str) -> GitStatus {
    let mut status = GitStatus::default();
    for line in out.lines() {
        if line.len() < 4 {
            continue;
        }
        let file = decode_git_filename(&line[3..]);
        if line.starts_with("??") {
            status.untracked.push(file);
            continue;
        }
        let staged = line.as_bytes()[0] as char;
        let unstaged = line.as_bytes()[1] as char;
        let bucket = if staged == 'M' || unstaged == 'M' {
            &mut status.modified
        } else if staged == 'A' || unstaged == 'A' {
            &mut status.added
        } else if staged == 'D' || unstaged == 'D' {
            &mut status.deleted
        } else if staged == 'R' || unstaged == 'R' {
            &mut status.renamed
        } else {
            continue;
        };
        if !bucket.contains(&file) {
            bucket.push(file);
        }
    }
    status
}

/// Git quotes paths with non-ASCII bytes and escapes them as octal
/// (`"doc/\350\257\246.md"`). Decode back to the real UTF-8 name.
pub fn decode_git_filename(name: &str) -> String {
    let Some(inner) = name
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    else {
        return name.to_string();
    };

    let mut bytes: Vec<u8> = Vec::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                bytes.push(b'\n');
            }
            Some('t') => {
                chars.next();
                bytes.push(b'\t');
            }
            Some('r') => {
                chars.next();
                bytes.push(b'\r');
            }
            Some('\\') => {
                chars.next();
                bytes.push(b'\\');
            }
            Some('"') => {
                chars.next();
                bytes.push(b'"');
            }
            Some(d) if d.is_digit(8) => {
                let mut value = 0u32;
                for _ in 0..3 {
                    match chars.peek() {
                        Some(d) if d.is_digit(8) => {
                            value = value * 8 + d.to_digit(8).unwrap_or(0);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            _ => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .with_context(|| format!("running git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn read_status(cwd: &Path) -> Result<GitStatus> {
    let out = run_git(cwd, &["status", "--porcelain"])?;
    Ok(parse_porcelain(&out))
}

/// Assemble the change diff: staged, unstaged, and the first few untracked
/// files rendered as creation diffs.
pub fn collect_diff(cwd: &Path) -> Result<String> {
    let staged = run_git(cwd, &["diff", "--cached"])?;
    let unstaged = run_git(cwd, &["diff"])?;
    let untracked_list = run_git(cwd, &["ls-files", "--others", "--exclude-standard"])?;

    let mut untracked = String::new();
    for file in untracked_list
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(MAX_UNTRACKED_FILES)
    {
        // --no-index exits non-zero when the files differ; the diff is still
        // on stdout.
        let output = Command::new("git")
            .current_dir(cwd)
            .args(["diff", "--no-index", "/dev/null", file])
            .output()
            .context("running git diff --no-index")?;
        untracked.push_str(&String::from_utf8_lossy(&output.stdout));
        untracked.push('\n');
    }

    let parts: Vec<&str> = [staged.as_str(), unstaged.as_str(), untracked.as_str()]
        .into_iter()
        .filter(|d| !d.trim().is_empty())
        .collect();
    Ok(parts.join("\n\n"))
}

pub fn truncate_diff(diff: &str, max_chars: usize) -> String {
    let total = diff.chars().count();
    if total <= max_chars {
        return diff.to_string();
    }
    let head: String = diff.chars().take(max_chars).collect();
    format!("{}\n\n... (truncated, {} chars total)", head, total)
}

/// Prompt for a single-line Conventional Commit message.
pub fn build_prompt(diff: &str, commit_type: Option<&str>, scope: Option<&str>) -> String {
    let mut chosen = String::new();
    if let Some(t) = commit_type {
        chosen.push_str(&format!("The type has already been chosen: {}.\n", t));
    }
    if let Some(s) = scope {
        chosen.push_str(&format!("The scope is: {}.\n", s));
    }
    format!(
        "Write exactly one Git commit message line for the change below.\n\n\
         Output format: type: description\n\
         The type must be one of: feat, fix, docs, style, refactor, perf, test, chore.\n\n\
         Example output:\n\
         feat: add user login flow\n\
         fix: plug memory leak in worker pool\n\
         chore: update dependency pins\n\n\
         {}Change diff:\n{}\n\n\
         Reply with the single commit message line and nothing else.",
        chosen, diff
    )
}

/// Distill a usable one-line Conventional Commit message out of raw model
/// output. Scans line by line past leaked reasoning, bullets, labels, and
/// code; prefers an explicit `type:` line, falls back to the first plausible
/// sentence and labels it `chore`.
pub fn extract_commit_message(raw: &str) -> Result<String> {
    let conventional = Regex::new(r"(?i)^(feat|fix|docs|style|refactor|perf|test|chore):")?;
    let label = Regex::new(
        r"(?i)^(analysis|explanation|type|scope|description|keywords|format|example|requirements|note|task)\s*:",
    )?;
    let code_like = Regex::new(r"(?i)^(import|export|const|let|var|function|class|fn |use |//|/\*|\{|\})")?;

    let cleaned = clean::strip_format(raw);

    let mut message = String::new();
    for line in cleaned.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('>')
            || trimmed.starts_with('-')
            || trimmed.starts_with('*')
            || trimmed.starts_with('`')
            || label.is_match(trimmed)
            || code_like.is_match(trimmed)
        {
            continue;
        }
        if conventional.is_match(trimmed) {
            message = trimmed.to_string();
            break;
        }
        let len = trimmed.chars().count();
        if message.is_empty() && (5..=100).contains(&len) {
            message = trimmed.to_string();
        }
    }

    if message.is_empty() {
        bail!("model output contained no usable commit message");
    }

    let decorated = Regex::new(r"(?i)^(commit message|git commit)\s*:\s*")?;
    let mut message = message
        .trim_start_matches(['#', '*', '`', '-', ' '])
        .trim_end_matches(['`', '-'])
        .trim()
        .to_string();
    message = decorated.replace(&message, "").into_owned();

    if !conventional.is_match(&message) {
        let len = message.chars().count();
        if (3..=100).contains(&len) {
            message = format!("chore: {}", message.trim_start_matches(':').trim_start());
        } else {
            bail!("generated commit message looks malformed: {}", message);
        }
    }

    if message.chars().count() > MAX_SUBJECT_CHARS {
        let head: String = message.chars().take(MAX_SUBJECT_CHARS - 3).collect();
        message = format!("{}...", head);
    }
    Ok(message)
}

/// Stage everything and commit with the approved message.
pub fn commit(cwd: &Path, message: &str) -> Result<()> {
    let message = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if message.is_empty() {
        bail!("refusing to commit with an empty message");
    }
    run_git(cwd, &["add", "-A"])?;
    run_git(cwd, &["commit", "-m", &message])?;
    Ok(())
}
