use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod clean;
mod commit;
mod config;
mod engine;
mod render;
mod rwkv;
mod session;
mod util;

use crate::render as render_mod;
use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "rwkv", version, about = "RWKV assistant CLI", long_about = None)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long = "json", global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Timeout (seconds) for network requests
    #[arg(long = "timeout", global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Write a starter config file
    Init(InitArgs),

    /// Inline code completion at a cursor position
    Complete(CompleteArgs),

    /// Ask a one-shot question
    Ask(AskArgs),

    /// Interactive multi-turn chat
    Chat(ChatArgs),

    /// Generate a Git commit message from the working tree
    CommitMsg(CommitMsgArgs),

    /// Manage conversation sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Inspect and edit configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
struct InitArgs {
    /// Completion endpoint URL
    #[arg(long)]
    endpoint: Option<String>,
    /// Completion endpoint password
    #[arg(long)]
    password: Option<String>,
    /// Chat endpoint URL
    #[arg(long = "chat-endpoint")]
    chat_endpoint: Option<String>,
    /// Chat endpoint password
    #[arg(long = "chat-password")]
    chat_password: Option<String>,
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug, Clone)]
struct CompleteArgs {
    /// File being edited
    #[arg(long)]
    file: PathBuf,
    /// 0-based cursor line
    #[arg(long)]
    line: usize,
    /// 0-based cursor column (chars)
    #[arg(long)]
    col: usize,
    /// Language id (defaults to the file extension)
    #[arg(long)]
    language: Option<String>,
    /// Number of candidates to request (overrides config)
    #[arg(long)]
    choices: Option<usize>,
    /// Endpoint override (use `mock` for the offline stub)
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    /// Question to ask
    #[arg(required = true, num_args = 1.., value_name = "PROMPT...")]
    prompt: Vec<String>,
    /// Stream output tokens as they arrive
    #[arg(long)]
    stream: bool,
    /// Associate with a named session
    #[arg(long)]
    session: Option<String>,
    /// Endpoint override (use `mock` for the offline stub)
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct ChatArgs {
    /// Start or continue a named session
    #[arg(long)]
    session: Option<String>,
    /// Endpoint override (use `mock` for the offline stub)
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct CommitMsgArgs {
    /// Read the diff from a file instead of the working tree
    #[arg(long = "diff-file")]
    diff_file: Option<PathBuf>,
    /// Output as JSON
    #[arg(long)]
    json: bool,
    /// Run `git add -A` and commit with the generated message
    #[arg(long)]
    commit: bool,
    /// Pre-chosen commit type (must be one of the configured types)
    #[arg(long = "type")]
    commit_type: Option<String>,
    /// Pre-chosen commit scope
    #[arg(long)]
    scope: Option<String>,
    /// Endpoint override (use `mock` for the offline stub)
    #[arg(long)]
    endpoint: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
enum SessionCommands {
    /// Create a new session and make it active
    New { name: String },
    /// List sessions
    List,
    /// Switch active session
    Switch { name: String },
    /// Show active session details
    Show,
    /// Search within a session by substring
    Search {
        name: String,
        #[arg(long = "contains")]
        contains: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Set one dotted key, e.g. `completion.temperature 0.3`
    Set { key: String, value: String },
    /// Flip the completion master switch
    Toggle,
}

#[derive(Debug, Clone)]
struct GlobalOpts {
    json: bool,
    verbose: u8,
    timeout_secs: Option<u64>,
}

impl GlobalOpts {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(60))
    }
}

fn vlog(globals: &GlobalOpts, msg: impl AsRef<str>) {
    if globals.verbose > 0 {
        eprintln!("[rwkv] {}", msg.as_ref());
    }
}

fn classify_error(e: &anyhow::Error) -> (String, Option<String>) {
    let msg = format!("{:#}", e).to_lowercase();
    if msg.contains("timed out") || msg.contains("timeout") {
        return ("timeout".into(), Some("try increasing --timeout".into()));
    }
    if msg.contains("error sending request")
        || msg.contains("connect")
        || msg.contains("dns")
        || msg.contains("network")
    {
        return ("network_error".into(), Some("check the endpoint URL and that the server is running".into()));
    }
    if msg.contains("no recognizable text")
        || msg.contains("parsing rwkv response")
        || msg.contains("no usable commit message")
    {
        return ("bad_response".into(), None);
    }
    if msg.contains("not found") {
        return ("not_found".into(), None);
    }
    if msg.contains("no changes") {
        return ("nothing_to_commit".into(), None);
    }
    if msg.contains("out of range") || msg.contains("empty prompt") || msg.contains("unknown commit type") {
        return ("invalid_args".into(), None);
    }
    if msg.contains("config") {
        return ("invalid_config".into(), None);
    }
    ("unknown".into(), None)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Cli {
        json,
        verbose,
        timeout_secs,
        command,
    } = cli;

    let globals = GlobalOpts {
        json,
        verbose,
        timeout_secs,
    };

    let result = match command {
        Commands::Init(args) => cmd_init(&globals, args).await,
        Commands::Complete(args) => cmd_complete(&globals, args).await,
        Commands::Ask(args) => cmd_ask(&globals, args).await,
        Commands::Chat(args) => cmd_chat(&globals, args).await,
        Commands::CommitMsg(args) => cmd_commit_msg(&globals, args).await,
        Commands::Session { command } => cmd_session(&globals, command).await,
        Commands::Config { command } => cmd_config(&globals, command).await,
    };

    if let Err(e) = result {
        if globals.json {
            let (code, hint) = classify_error(&e);
            let msg = e.to_string();
            render_mod::print_json_error(&code, &msg, hint.as_deref());
        } else {
            eprintln!("{}", e);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn completion_sampling(cfg: &config::CompletionConfig) -> rwkv::SamplingParams {
    rwkv::SamplingParams {
        max_tokens: cfg.max_tokens,
        temperature: cfg.temperature,
        top_p: cfg.top_p,
        top_k: cfg.top_k,
        alpha_presence: cfg.alpha_presence,
        alpha_frequency: cfg.alpha_frequency,
        stop_tokens: rwkv::DEFAULT_STOP_TOKENS.to_vec(),
    }
}

fn chat_sampling(cfg: &config::ChatConfig) -> rwkv::SamplingParams {
    rwkv::SamplingParams {
        max_tokens: cfg.max_tokens,
        temperature: cfg.temperature,
        top_p: cfg.top_p,
        top_k: cfg.top_k,
        alpha_presence: 1.0,
        alpha_frequency: 0.1,
        stop_tokens: rwkv::DEFAULT_STOP_TOKENS.to_vec(),
    }
}

fn commit_sampling() -> rwkv::SamplingParams {
    rwkv::SamplingParams {
        max_tokens: 200,
        temperature: 0.7,
        top_p: 0.3,
        top_k: 1,
        alpha_presence: 1.0,
        alpha_frequency: 0.1,
        stop_tokens: rwkv::DEFAULT_STOP_TOKENS.to_vec(),
    }
}

fn completion_backend(
    endpoint: &str,
    cfg: &config::CompletionConfig,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn rwkv::CompletionBackend>> {
    if endpoint.eq_ignore_ascii_case("mock") {
        return Ok(Arc::new(rwkv::MockBackend));
    }
    let client = rwkv::RwkvClient::new(endpoint, cfg.password.as_str(), timeout)?;
    Ok(Arc::new(rwkv::RwkvBackend::new(client, completion_sampling(cfg))))
}

async fn cmd_init(_globals: &GlobalOpts, args: InitArgs) -> anyhow::Result<()> {
    let path = config::default_config_path()?;
    if path.exists() && !args.force {
        anyhow::bail!(
            "config already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    let mut cfg = config::AppConfig::default();
    if let Some(e) = args.endpoint {
        cfg.completion.endpoint = e;
    }
    if let Some(p) = args.password {
        cfg.completion.password = p;
    }
    if let Some(e) = args.chat_endpoint {
        cfg.chat.endpoint = e;
    }
    if let Some(p) = args.chat_password {
        cfg.chat.password = p;
    }
    config::write_config(&path, &cfg)?;
    println!("config written: {}", path.display());
    Ok(())
}

async fn cmd_complete(globals: &GlobalOpts, args: CompleteArgs) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    if !args.file.exists() {
        anyhow::bail!("file not found: {}", args.file.display());
    }
    let cfg = config::load_or_default()?;

    #[derive(serde::Serialize)]
    struct Out {
        suggestions: Vec<String>,
    }

    if !cfg.enabled {
        vlog(globals, "completion disabled in config; nothing to do");
        if globals.json {
            render_mod::print_json(&Out { suggestions: vec![] });
        }
        return Ok(());
    }

    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let (prefix, suffix) = engine::split_at_cursor(&text, args.line, args.col)?;
    vlog(
        globals,
        format!("context: prefix {} chars, suffix {} chars", prefix.len(), suffix.len()),
    );

    let language_id = args.language.clone().unwrap_or_else(|| {
        args.file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("plaintext")
            .to_string()
    });
    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| cfg.completion.endpoint.clone());
    let backend = completion_backend(&endpoint, &cfg.completion, globals.timeout())?;

    let opts = engine::EngineOptions {
        num_choices: args.choices.unwrap_or(cfg.completion.num_choices).max(1),
        debounce_delay: Duration::from_millis(cfg.completion.debounce_delay_ms),
        ..engine::EngineOptions::default()
    };
    let clean_opts = clean::CleanOptions {
        overlap_window: cfg.completion.overlap_window,
        max_lines: cfg.completion.max_lines,
        ..clean::CleanOptions::default()
    };
    let eng = engine::CompletionEngine::new(backend, opts, clean_opts);

    let req = engine::CompletionRequest {
        path: args.file.display().to_string(),
        language_id,
        line: args.line,
        prefix,
        suffix,
    };

    match eng.complete(&req).await? {
        engine::Outcome::Suggestions(suggestions) => {
            if globals.json {
                render_mod::print_json(&Out { suggestions });
            } else {
                for (i, s) in suggestions.iter().enumerate() {
                    if i > 0 {
                        println!("---");
                    }
                    println!("{}", s);
                }
            }
        }
        engine::Outcome::Empty | engine::Outcome::Cancelled => {
            vlog(globals, "no completion");
            if globals.json {
                render_mod::print_json(&Out { suggestions: vec![] });
            }
        }
    }
    Ok(())
}

async fn cmd_ask(globals: &GlobalOpts, args: AskArgs) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("empty prompt; provide text, e.g. rwkv ask \"What is RWKV?\"");
    }
    let cfg = config::load_or_default()?;
    let session_name = match &args.session {
        Some(s) => Some(s.clone()),
        None => session::get_active_session()?,
    };
    let endpoint = args.endpoint.unwrap_or_else(|| cfg.chat.endpoint.clone());

    #[derive(serde::Serialize)]
    struct Out<'a> {
        answer: &'a str,
    }

    if endpoint.eq_ignore_ascii_case("mock") {
        let answer = format!("[stub answer] {}", prompt);
        if let Some(name) = &session_name {
            session::append_exchange(name, &prompt, &answer)?;
        }
        if globals.json {
            render_mod::print_json(&Out { answer: &answer });
        } else {
            println!("{}", answer);
        }
        return Ok(());
    }

    let history = match &session_name {
        Some(name) => session::load_session_history(name)?,
        None => vec![],
    };
    let messages = session::build_messages_with_truncation(&history, &prompt, 4000);
    let content = rwkv::render_conversation(&messages, false);
    let client = rwkv::RwkvClient::new(endpoint.as_str(), cfg.chat.password.as_str(), globals.timeout())?;
    let params = chat_sampling(&cfg.chat);

    // In JSON mode, force non-streaming to produce a single JSON object.
    let stream = if globals.json { false } else { args.stream };
    if stream {
        use futures_util::StreamExt;
        use std::io::Write as _;
        let mut s = client.generate_stream(&content, &params).await?;
        let mut full = String::new();
        while let Some(chunk) = s.next().await {
            let t = chunk?;
            print!("{}", t);
            std::io::stdout().flush().ok();
            full.push_str(&t);
        }
        println!();
        if let Some(name) = &session_name {
            session::append_exchange(name, &prompt, &full)?;
        }
    } else {
        let texts = client.generate(&[content], &params).await?;
        let answer = texts.into_iter().next().unwrap_or_default();
        if let Some(name) = &session_name {
            session::append_exchange(name, &prompt, &answer)?;
        }
        if globals.json {
            render_mod::print_json(&Out { answer: &answer });
        } else {
            println!("{}", answer);
        }
    }
    Ok(())
}

async fn cmd_chat(globals: &GlobalOpts, args: ChatArgs) -> anyhow::Result<()> {
    use futures_util::StreamExt;
    use std::io::{self, Write};
    dotenvy::dotenv().ok();

    let session_name = match args.session {
        Some(name) => name,
        None => match session::get_active_session()? {
            Some(s) => s,
            None => anyhow::bail!(
                "no session specified and no active session. Use --session NAME or `rwkv session new NAME`"
            ),
        },
    };
    session::create_session_if_missing(&session_name)?;
    session::set_active_session(&session_name)?;

    println!("chatting in session: {} (Ctrl+C to exit)", &session_name);
    let cfg = config::load_or_default()?;
    let endpoint = args.endpoint.unwrap_or_else(|| cfg.chat.endpoint.clone());
    let params = chat_sampling(&cfg.chat);
    let client = if endpoint.eq_ignore_ascii_case("mock") {
        None
    } else {
        Some(rwkv::RwkvClient::new(endpoint.as_str(), cfg.chat.password.as_str(), globals.timeout())?)
    };

    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut input = String::new();
        let n = io::stdin().read_line(&mut input)?;
        if n == 0 {
            eprintln!("exiting chat; session saved");
            break;
        }
        let prompt = input.trim().to_string();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt.as_str(), "/exit" | "exit" | "/quit" | "quit") {
            eprintln!("bye");
            break;
        }

        let Some(client) = client.as_ref() else {
            let answer = format!("[stub chat] {}", prompt);
            session::append_exchange(&session_name, &prompt, &answer)?;
            println!("{}", answer);
            continue;
        };

        let history = session::load_session_history(&session_name)?;
        let messages = session::build_messages_with_truncation(&history, &prompt, 4000);
        let content = rwkv::render_conversation(&messages, false);
        let mut stream = client.generate_stream(&content, &params).await?;
        let mut full = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(t) => {
                    print!("{}", t);
                    io::stdout().flush().ok();
                    full.push_str(&t);
                }
                Err(e) => {
                    println!();
                    return Err(e);
                }
            }
        }
        println!();
        session::append_exchange(&session_name, &prompt, &full)?;
    }
    Ok(())
}

async fn cmd_commit_msg(globals: &GlobalOpts, args: CommitMsgArgs) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = config::load_or_default()?;

    if let Some(t) = &args.commit_type {
        if !cfg.git.commit_types.iter().any(|k| k == t) {
            anyhow::bail!(
                "unknown commit type: {} (configured: {})",
                t,
                cfg.git.commit_types.join(", ")
            );
        }
    }

    let diff = match &args.diff_file {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("diff file not found: {}", path.display());
            }
            std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            let cwd = std::env::current_dir()?;
            let status = commit::read_status(&cwd)?;
            if !status.has_changes() {
                anyhow::bail!("no changes to commit");
            }
            commit::collect_diff(&cwd)?
        }
    };
    if diff.trim().is_empty() {
        anyhow::bail!("no changes to analyze");
    }
    let limited = commit::truncate_diff(&diff, commit::MAX_DIFF_CHARS);
    vlog(globals, format!("diff: {} chars after truncation", limited.len()));

    let endpoint = args.endpoint.unwrap_or_else(|| cfg.chat.endpoint.clone());
    let is_json = globals.json || args.json;

    let message = if endpoint.eq_ignore_ascii_case("mock") {
        "chore: update working tree".to_string()
    } else {
        let messages = vec![
            rwkv::ChatMessage {
                role: "system".to_string(),
                content: "You are a Git commit message expert.".to_string(),
            },
            rwkv::ChatMessage {
                role: "user".to_string(),
                content: commit::build_prompt(
                    &limited,
                    args.commit_type.as_deref(),
                    args.scope.as_deref(),
                ),
            },
        ];
        let content = rwkv::render_conversation(&messages, false);
        let client = rwkv::RwkvClient::new(endpoint.as_str(), cfg.chat.password.as_str(), globals.timeout())?;
        let raw = client
            .generate(&[content], &commit_sampling())
            .await?
            .into_iter()
            .next()
            .context("empty response from endpoint")?;
        commit::extract_commit_message(&raw)?
    };

    if is_json {
        #[derive(serde::Serialize)]
        struct Out<'a> {
            r#type: &'a str,
            subject: &'a str,
            message: &'a str,
        }
        let (kind, subject) = message.split_once(':').unwrap_or(("chore", message.as_str()));
        let out = Out {
            r#type: kind.trim(),
            subject: subject.trim(),
            message: &message,
        };
        render_mod::print_json(&out);
    } else {
        println!("{}", message);
    }

    if args.commit {
        let cwd = std::env::current_dir()?;
        commit::commit(&cwd, &message)?;
        eprintln!("committed");
    }
    Ok(())
}

async fn cmd_session(globals: &GlobalOpts, cmd: SessionCommands) -> anyhow::Result<()> {
    use session::*;
    match cmd {
        SessionCommands::New { name } => {
            create_session_if_missing(&name)?;
            set_active_session(&name)?;
            println!("created and activated session: {}", name);
        }
        SessionCommands::List => {
            let metas = list_sessions_metadata()?;
            if globals.json {
                #[derive(serde::Serialize)]
                struct J<'a> {
                    name: &'a str,
                    lines: usize,
                    size: u64,
                    last_used_ms: Option<i64>,
                }
                let v: Vec<_> = metas
                    .iter()
                    .map(|m| J {
                        name: &m.name,
                        lines: m.num_lines,
                        size: m.file_size,
                        last_used_ms: m.last_used_ms,
                    })
                    .collect();
                render_mod::print_json(&v);
            } else {
                for m in metas {
                    let last = m
                        .last_used_ms
                        .and_then(chrono::DateTime::from_timestamp_millis)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}\tlines={}\tsize={}\tlast={}",
                        m.name, m.num_lines, m.file_size, last
                    );
                }
            }
        }
        SessionCommands::Switch { name } => {
            let path = session_file_path(&name)?;
            if !path.exists() {
                anyhow::bail!("session not found: {}", name);
            }
            set_active_session(&name)?;
            println!("active session: {}", name);
        }
        SessionCommands::Show => {
            let active = get_active_session()?;
            match active {
                Some(name) => {
                    let metas = list_sessions_metadata()?;
                    if let Some(m) = metas.into_iter().find(|m| m.name == name) {
                        if globals.json {
                            #[derive(serde::Serialize)]
                            struct J<'a> {
                                active: &'a str,
                                lines: usize,
                                size: u64,
                            }
                            render_mod::print_json(&J {
                                active: &m.name,
                                lines: m.num_lines,
                                size: m.file_size,
                            });
                        } else {
                            println!("active: {} (lines={}, size={})", m.name, m.num_lines, m.file_size);
                        }
                    } else {
                        println!("active: {} (no file yet)", name);
                    }
                }
                None => println!("no active session"),
            }
        }
        SessionCommands::Search { name, contains } => {
            let recs = search_session(&name, &contains)?;
            if globals.json {
                render_mod::print_json(&recs);
            } else {
                for r in recs {
                    println!("{}\t{}: {}", r.timestamp_ms, r.role, r.content);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_config(globals: &GlobalOpts, cmd: ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let cfg = config::load_or_default()?;
            if globals.json {
                render_mod::print_json(&cfg);
            } else {
                print!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        ConfigCommands::Set { key, value } => {
            let path = config::default_config_path()?;
            config::set_value(&path, &key, &value)?;
            println!("updated {}", key);
        }
        ConfigCommands::Toggle => {
            let path = config::default_config_path()?;
            let mut cfg = config::load_config_if_exists(&path)?.unwrap_or_default();
            cfg.enabled = !cfg.enabled;
            config::write_config(&path, &cfg)?;
            println!(
                "completion {}",
                if cfg.enabled { "enabled" } else { "disabled" }
            );
        }
    }
    Ok(())
}
