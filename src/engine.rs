use crate::clean::{self, CleanOptions};
use crate::rwkv::CompletionBackend;
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Lines of context taken before and after the cursor.
pub const PREFIX_LINES: usize = 30;
pub const SUFFIX_LINES: usize = 10;

/// One completion attempt as captured at the editor boundary.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub path: String,
    pub language_id: String,
    /// 0-based cursor line, used for debounce position tracking.
    pub line: usize,
    pub prefix: String,
    pub suffix: String,
}

/// What a completion attempt produced. `Cancelled` means a newer request
/// superseded this one; `Empty` means the pipeline discarded every candidate.
/// Neither is an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Suggestions(Vec<String>),
    Empty,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Prefix tail (chars) sent as the prompt.
    pub prompt_window: usize,
    /// Prefixes shorter than this (trimmed chars) never trigger a request.
    pub min_prefix_chars: usize,
    pub num_choices: usize,
    pub debounce_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            prompt_window: 180,
            min_prefix_chars: 10,
            num_choices: 1,
            debounce_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Trigger {
    at: Instant,
    path: String,
    line: usize,
}

/// How long a trigger should wait before firing. A trigger at the same
/// position within the delay window coalesces (waits out the remainder); a
/// materially different position, or a settled window, fires immediately.
fn debounce_wait(
    last: Option<&Trigger>,
    now: Instant,
    path: &str,
    line: usize,
    delay: Duration,
) -> Option<Duration> {
    let last = last?;
    if last.path != path || last.line != line {
        return None;
    }
    let elapsed = now.saturating_duration_since(last.at);
    if elapsed >= delay {
        None
    } else {
        Some(delay - elapsed)
    }
}

/// Drives one completion attempt end to end: debounce, prompt construction,
/// the backend call, and the cleaning pipeline. Latest request wins: every
/// call bumps a generation counter, and any request that observes a newer
/// generation after a suspension point reports `Cancelled` without touching
/// the pipeline.
pub struct CompletionEngine {
    backend: Arc<dyn CompletionBackend>,
    opts: EngineOptions,
    clean: CleanOptions,
    generation: AtomicU64,
    last_trigger: Mutex<Option<Trigger>>,
}

impl CompletionEngine {
    pub fn new(backend: Arc<dyn CompletionBackend>, opts: EngineOptions, clean: CleanOptions) -> Self {
        Self {
            backend,
            opts,
            clean,
            generation: AtomicU64::new(0),
            last_trigger: Mutex::new(None),
        }
    }

    pub async fn complete(&self, req: &CompletionRequest) -> Result<Outcome> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let now = Instant::now();
        let wait = {
            let mut last = self.last_trigger.lock().await;
            let wait = debounce_wait(last.as_ref(), now, &req.path, req.line, self.opts.debounce_delay);
            *last = Some(Trigger {
                at: now,
                path: req.path.clone(),
                line: req.line,
            });
            wait
        };
        if let Some(delay) = wait {
            tokio::time::sleep(delay).await;
            if self.generation.load(Ordering::SeqCst) != ticket {
                return Ok(Outcome::Cancelled);
            }
        }

        if req.prefix.trim().chars().count() < self.opts.min_prefix_chars {
            return Ok(Outcome::Empty);
        }

        let prompt = clean::char_tail(&req.prefix, self.opts.prompt_window);
        let raws = self.backend.generate(prompt, self.opts.num_choices).await?;

        // Stale responses are dropped before the pipeline ever sees them.
        if self.generation.load(Ordering::SeqCst) != ticket {
            return Ok(Outcome::Cancelled);
        }

        let cleaned = clean::clean_batch(&raws, &req.prefix, &self.clean);
        let mut unique: Vec<String> = Vec::new();
        for candidate in cleaned {
            if candidate.is_empty() {
                continue;
            }
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }
        if unique.is_empty() {
            Ok(Outcome::Empty)
        } else {
            Ok(Outcome::Suggestions(unique))
        }
    }
}

/// Split file content into the prefix/suffix context around a 0-based cursor,
/// windowed to `PREFIX_LINES` before and `SUFFIX_LINES` after.
pub fn split_at_cursor(text: &str, line: usize, col: usize) -> Result<(String, String)> {
    let lines: Vec<&str> = text.lines().collect();
    if line >= lines.len() {
        bail!("cursor line {} out of range ({} lines)", line, lines.len());
    }
    let current = lines[line];
    let col_byte = current
        .char_indices()
        .nth(col)
        .map(|(i, _)| i)
        .unwrap_or(current.len());

    let start = line.saturating_sub(PREFIX_LINES);
    let mut prefix = lines[start..line].join("\n");
    if line > start {
        prefix.push('\n');
    }
    prefix.push_str(&current[..col_byte]);

    let end = (line + 1 + SUFFIX_LINES).min(lines.len());
    let mut suffix = current[col_byte..].to_string();
    for l in &lines[line + 1..end] {
        suffix.push('\n');
        suffix.push_str(l);
    }
    Ok((prefix, suffix))
}
