//! plover - headless AI coding agent kernel.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use plover::agent::{Agent, AgentEvent};
use plover::config::Config;
use plover::extensions::ExtensionBus;
use plover::provider::{find_model, StreamOptions, MODEL_CATALOG};
use plover::rpc::{SessionEvent, SessionHost};
use plover::session::{self, Session};
use plover::tools::ToolRegistry;
use plover::ui_bridge::UiBridge;
use plover::{cli, providers, rpc, server};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("fatal: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: cli::Cli) -> Result<()> {
    let config = Config::load()?;

    let sessions_dir = cli
        .sessions_dir
        .as_ref()
        .map_or_else(|| config.sessions_dir(), std::path::PathBuf::from);

    let session = open_session(&cli, &sessions_dir)?;

    let model_id = cli
        .model
        .clone()
        .or_else(|| config.default_model.clone())
        .unwrap_or_else(|| MODEL_CATALOG[0].id.to_string());
    let provider_name = config
        .default_provider
        .clone()
        .unwrap_or_else(|| MODEL_CATALOG[0].provider.to_string());
    let spec = find_model(&provider_name, &model_id)
        .ok_or_else(|| anyhow::anyhow!("unknown model: {provider_name}/{model_id}"))?;
    let provider = providers::create_provider(spec)?;

    let thinking_level = config
        .default_thinking_level
        .as_deref()
        .and_then(|level| level.parse().ok())
        .unwrap_or_default();
    let stream_options = StreamOptions {
        api_key: cli.api_key.clone(),
        max_tokens: None,
        thinking_level,
        session_id: Some(session.header.id.clone()),
    };

    let cwd = std::env::current_dir()?;
    let mut tools = ToolRegistry::builtin(&config.enabled_tool_names(), &cwd);

    // Event plane: everything flows through one broadcast channel.
    let (events_tx, _) = tokio::sync::broadcast::channel::<SessionEvent>(1024);
    let ui_events = events_tx.clone();
    let ui = Arc::new(UiBridge::new(move |request| {
        let _ = ui_events.send(SessionEvent::UiRequest(request));
    }));

    // Extensions are linked in at build time; none ship by default.
    let bus = Arc::new(ExtensionBus::empty(Arc::clone(&ui)));
    for tool in bus.collect_tools() {
        if let Some(warning) = tools.register(tool) {
            ui.notify("notify", serde_json::json!({ "message": warning }));
        }
    }

    let mut agent_config = config.agent_config();
    if let Some(prompt) = &cli.system_prompt {
        agent_config.system_prompt = Some(prompt.clone());
    }

    let agent = Arc::new(Agent::new(
        session,
        provider,
        tools,
        bus,
        agent_config,
        stream_options,
    ));
    agent
        .bus()
        .bind_actions(Arc::new(plover::agent::AgentHostActions::new(&agent)));
    agent.flags().auto_compaction.store(
        config.compaction_enabled(),
        std::sync::atomic::Ordering::SeqCst,
    );
    agent
        .flags()
        .auto_retry
        .store(config.retry_enabled(), std::sync::atomic::Ordering::SeqCst);
    {
        let queue = agent.queue();
        let mut queue = queue.lock().expect("queue lock");
        queue.steering_mode = config.steering_queue_mode();
        queue.follow_up_mode = config.follow_up_queue_mode();
    }

    let host = Arc::new(SessionHost::new(
        Arc::clone(&agent),
        ui,
        events_tx,
        sessions_dir,
    ));

    if let Some(prompt) = &cli.print {
        return run_print(&host, prompt).await;
    }

    match cli.mode.as_str() {
        "serve" => server::serve(host, server::bind_address()).await?,
        _ => rpc::run_stdio(host).await?,
    }
    Ok(())
}

fn open_session(cli: &cli::Cli, sessions_dir: &Path) -> Result<Session> {
    if cli.no_session {
        return Ok(Session::in_memory());
    }
    if let Some(path) = &cli.session {
        return Ok(Session::open(Path::new(path))?);
    }
    if cli.r#continue {
        if let Some(recent) = session::list_sessions(sessions_dir)?.into_iter().next() {
            return Ok(Session::open(&recent.path)?);
        }
    }
    Ok(Session::create_in_dir(sessions_dir)?)
}

/// One-shot mode: run a single prompt, stream text to stdout, exit.
async fn run_print(host: &Arc<SessionHost>, prompt: &str) -> Result<()> {
    use plover::model::AssistantDelta;
    use std::io::Write as _;

    let on_event: plover::agent::EventFn = Arc::new(|event: AgentEvent| {
        let mut stdout = std::io::stdout();
        match event {
            AgentEvent::MessageUpdate {
                delta: AssistantDelta::TextDelta { delta, .. },
            } => {
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
            AgentEvent::AgentEnd { error: Some(error), .. } => {
                eprintln!("\nerror: {error}");
            }
            AgentEvent::AgentEnd { .. } => {
                let _ = writeln!(stdout);
            }
            _ => {}
        }
    });

    host.agent
        .run_prompt(Some(plover::model::Message::user_text(prompt)), on_event)
        .await?;
    Ok(())
}
