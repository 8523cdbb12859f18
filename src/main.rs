use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use skillrun_core::{CustomerId, DocumentId, ExecutionEvent, Skill, SkillId, TeamId};
use skillrun_engine::{
    AmbientContext, CustomerContext, ExecutionConfig, ExecutionOrchestrator, InMemorySkillCatalog,
    ParameterForm, SkillCatalog, Validation,
};
use skillrun_settings::{load_settings, load_settings_from_path};
use skillrun_telemetry::{init_telemetry, TelemetryConfig};
use skillrun_transport::{ConnectionConfig, ConnectionManager, WsConnector};

/// Run a skill against the execution service and stream its output.
#[derive(Parser, Debug)]
#[command(name = "skillrun", version)]
struct Cli {
    /// JSON file with one skill or an array of skills.
    #[arg(long)]
    skill_file: PathBuf,

    /// Skill id to run. Optional when the file holds a single skill.
    #[arg(long)]
    skill: Option<String>,

    #[arg(long)]
    team: String,

    #[arg(long)]
    customer_id: Option<String>,

    #[arg(long)]
    customer_name: Option<String>,

    #[arg(long)]
    industry: Option<String>,

    #[arg(long)]
    company_size: Option<String>,

    #[arg(long)]
    reference_document: Option<String>,

    /// Parameter value, repeatable.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    #[arg(long, env = "SKILLRUN_TOKEN", hide_env_values = true, value_parser = parse_token)]
    token: SecretString,

    /// Overrides `connection.url` from settings.
    #[arg(long)]
    url: Option<String>,

    /// Settings file instead of ~/.skillrun/settings.json.
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn parse_token(raw: &str) -> Result<SecretString, String> {
    if raw.trim().is_empty() {
        return Err("token is empty".to_string());
    }
    Ok(SecretString::from(raw.to_string()))
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    if name.trim().is_empty() {
        return Err(format!("missing parameter name in {raw:?}"));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(url) = &cli.url {
        settings.connection.url = url.clone();
        settings.validate().context("invalid --url")?;
    }
    init_telemetry(&TelemetryConfig::from(&settings.logging));

    let catalog = InMemorySkillCatalog::load(&cli.skill_file)
        .with_context(|| format!("failed to load skills from {}", cli.skill_file.display()))?;
    let skill = pick_skill(&catalog, cli.skill.as_deref())?;
    let ctx = ambient_context(&cli);

    let mut form = ParameterForm::prepare(&skill, &ctx);
    for (name, raw) in &cli.params {
        if !form.set_raw(name, raw) {
            bail!("skill {} has no parameter named {name}", skill.id);
        }
    }
    let validation = form.validate();
    if !validation.is_valid() {
        for line in field_errors(&skill, &validation) {
            eprintln!("{line}");
        }
        bail!("skill {} is missing required parameters", skill.id);
    }
    let values = form.into_values();

    let connection = ConnectionManager::new(
        Arc::new(WsConnector::new(settings.connection.url.clone())),
        ConnectionConfig::from(&settings.connection),
    );
    connection
        .connect(cli.token.clone())
        .await
        .with_context(|| format!("failed to connect to {}", settings.connection.url))?;

    let orch = ExecutionOrchestrator::new(
        skill.clone(),
        &ctx,
        connection.clone(),
        ExecutionConfig::from(&settings.execution),
    );
    let mut events = orch.subscribe();
    tracing::info!(skill_id = %skill.id, surface_id = %orch.surface_id(), "running skill");

    orch.start(values.clone(), ctx.reference_document.clone())
        .await?;
    let completed = follow_turn(&orch, &mut events).await?;

    if skill.multi_turn && completed {
        converse(&orch, &mut events, &values, &ctx).await?;
    }

    connection.disconnect().await;
    if completed {
        Ok(())
    } else {
        Err(anyhow!("execution did not complete"))
    }
}

fn pick_skill(catalog: &InMemorySkillCatalog, id: Option<&str>) -> anyhow::Result<Skill> {
    if let Some(id) = id {
        return catalog
            .get(&SkillId::from_raw(id))
            .ok_or_else(|| anyhow!("skill {id} not found"));
    }
    let mut skills = catalog.list();
    match skills.len() {
        1 => Ok(skills.remove(0)),
        0 => bail!("skill file is empty"),
        _ => {
            let mut ids: Vec<String> = skills.iter().map(|s| s.id.to_string()).collect();
            ids.sort();
            bail!("several skills available, pick one with --skill: {}", ids.join(", "))
        }
    }
}

/// One `label: message` line per failing field, in parameter order.
fn field_errors(skill: &Skill, validation: &Validation) -> Vec<String> {
    skill
        .parameters
        .iter()
        .filter_map(|spec| {
            let err = validation.errors.get(&spec.name)?;
            Some(format!("{}: {err}", spec.display_name()))
        })
        .collect()
}

fn ambient_context(cli: &Cli) -> AmbientContext {
    let has_customer = cli.customer_id.is_some()
        || cli.customer_name.is_some()
        || cli.industry.is_some()
        || cli.company_size.is_some();
    let customer = has_customer.then(|| CustomerContext {
        id: cli.customer_id.as_deref().map(CustomerId::from_raw),
        name: cli.customer_name.clone(),
        industry: cli.industry.clone(),
        company_size: cli.company_size.clone(),
    });
    AmbientContext {
        team_id: TeamId::from_raw(&cli.team),
        customer,
        reference_document: cli.reference_document.as_deref().map(DocumentId::from_raw),
    }
}

/// Read follow-ups from stdin until `/quit`, EOF or a completed `/end`.
async fn converse(
    orch: &ExecutionOrchestrator,
    events: &mut broadcast::Receiver<ExecutionEvent>,
    values: &skillrun_core::ParameterValues,
    ctx: &AmbientContext,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("follow-up messages, /end to finish, /new to start over, /quit to exit");
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let ending = line.trim() == "/end";
        let sent = match line.trim() {
            "" => continue,
            "/quit" => break,
            "/end" => orch.end_conversation(),
            "/new" => {
                orch.start_new_conversation();
                orch.start(values.clone(), ctx.reference_document.clone()).await
            }
            message => orch.send_follow_up(message),
        };
        if let Err(e) = sent {
            eprintln!("error: {e}");
            continue;
        }
        let completed = follow_turn(orch, events).await?;
        if ending && completed {
            break;
        }
    }
    Ok(())
}

/// Print the turn as it streams. Returns `true` once it completed.
async fn follow_turn(
    orch: &ExecutionOrchestrator,
    events: &mut broadcast::Receiver<ExecutionEvent>,
) -> anyhow::Result<bool> {
    let mut stdout = std::io::stdout();
    let mut streamed = String::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ExecutionEvent::Chunk { text, .. }) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                    streamed.push_str(&text);
                }
                Ok(ExecutionEvent::Completed { content, document_id, .. }) => {
                    // The final content is canonical; reprint when it differs from the stream.
                    if streamed != content {
                        if !streamed.is_empty() {
                            writeln!(stdout, "\n---")?;
                        }
                        write!(stdout, "{content}")?;
                    }
                    writeln!(stdout)?;
                    if let Some(document_id) = document_id {
                        tracing::info!(%document_id, "document saved");
                    }
                    return Ok(true);
                }
                Ok(ExecutionEvent::Failed { message, retryable, .. }) => {
                    let hint = if retryable { " (you may retry)" } else { "" };
                    eprintln!("\nerror: {message}{hint}");
                    return Ok(false);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(false),
            },
            _ = tokio::signal::ctrl_c() => {
                orch.cancel();
                eprintln!("\ncancelled");
                return Ok(false);
            }
        }
    }
}
