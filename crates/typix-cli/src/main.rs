use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use typix_contracts::chat::{
    parse_chat_input, ChatInput, MessageType, ObservedStatus, CHAT_HELP_COMMANDS,
};
use typix_contracts::providers::ProviderDescriptor;
use typix_engine::data_uri;
use typix_engine::service::{
    AttachmentInput, CreateChat, CreateMessage, GenerationView, UpdateChat,
};
use typix_engine::{
    default_provider_registry, ChatService, Engine, EngineConfig, EnvSettings, RequestContext,
};

#[derive(Debug, Parser)]
#[command(name = "typix-rs", version, about = "Typix image chat CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Providers(ProvidersArgs),
    Generate(GenerateArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct ProvidersArgs {
    /// Show the schemas used when the host supplies Cloudflare credentials.
    #[arg(long)]
    builtin: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = "dryrun-t2i")]
    model: String,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
    #[arg(long, default_value = "local")]
    user: String,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = "dryrun-i2i")]
    model: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
    #[arg(long, default_value = "local")]
    user: String,
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const EXIT_GENERATION_FAILED: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("typix-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Providers(args) => run_providers(args),
        Command::Generate(args) => run_generate(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
    }
}

fn build_engine(out: Option<PathBuf>, events: Option<PathBuf>) -> Result<Engine> {
    let mut config = EngineConfig::from_env();
    if let Some(out) = out {
        config.data_dir = out;
    }
    if events.is_some() {
        config.events_path = events;
    }
    Engine::from_config(config, Arc::new(EnvSettings))
}

fn run_providers(args: ProvidersArgs) -> Result<i32> {
    let config = EngineConfig::from_env();
    if args.builtin && config.builtin_cloudflare.is_none() {
        bail!(
            "built-in credentials are not configured (set TYPIX_CLOUDFLARE_BUILTIN=1, \
             CLOUDFLARE_ACCOUNT_ID and CLOUDFLARE_API_TOKEN)"
        );
    }
    let descriptors = default_provider_registry(&config).descriptors();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(0);
    }
    for descriptor in &descriptors {
        print_descriptor(descriptor);
    }
    Ok(0)
}

fn print_descriptor(descriptor: &ProviderDescriptor) {
    let mut flags = Vec::new();
    if !descriptor.enabled_by_default {
        flags.push("disabled by default");
    }
    if descriptor.supports_cors {
        flags.push("cors");
    }
    if descriptor.settings.is_builtin() {
        flags.push("built-in credentials");
    }
    if flags.is_empty() {
        println!("{} ({})", descriptor.id, descriptor.name);
    } else {
        println!("{} ({}) [{}]", descriptor.id, descriptor.name, flags.join(", "));
    }
    let settings = descriptor
        .settings
        .items()
        .iter()
        .map(|item| {
            if item.required {
                format!("{}*", item.key)
            } else {
                item.key.clone()
            }
        })
        .collect::<Vec<String>>();
    println!("  settings: {}", settings.join(", "));
    for model in &descriptor.models {
        match model.max_input_images {
            Some(max) => println!("  {} {} (up to {max} images)", model.ability, model.id),
            None => println!("  {} {}", model.ability, model.id),
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let engine = build_engine(args.out.clone(), args.events.clone())?;
    let ctx = RequestContext::new(&args.user);
    let attachments = args
        .images
        .iter()
        .map(|path| read_attachment(path))
        .collect::<Result<Vec<AttachmentInput>>>()?;

    let created = engine.service().create_chat(
        &ctx,
        CreateChat {
            title: Some(truncate_title(&args.prompt)),
            provider: args.provider.clone(),
            model: args.model.clone(),
            content: Some(args.prompt.clone()),
            attachments,
        },
    )?;
    let Some(generation_id) = created
        .messages
        .as_ref()
        .and_then(|pair| pair.generation_id())
        .map(str::to_string)
    else {
        bail!("prompt is empty");
    };

    let timeout = Duration::from_secs(args.timeout_secs);
    let result = wait_for_generation(engine.service(), &ctx, &generation_id, timeout);
    engine.shutdown()?;
    let view = result?;
    print_generation(&view);
    if view.observed_status == ObservedStatus::Completed {
        Ok(0)
    } else {
        Ok(EXIT_GENERATION_FAILED)
    }
}

struct ChatSession {
    provider: String,
    model: String,
    chat_id: Option<String>,
    attachments: Vec<AttachmentInput>,
    last_message_id: Option<String>,
    last_generation_id: Option<String>,
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let engine = build_engine(args.out.clone(), args.events.clone())?;
    let service = engine.service();
    let ctx = RequestContext::new(&args.user);
    let timeout = Duration::from_secs(args.timeout_secs);
    if !service
        .dispatcher()
        .providers()
        .contains_model(&args.provider, &args.model)
    {
        bail!(
            "model '{}' not found for provider '{}'",
            args.model,
            args.provider
        );
    }
    let mut session = ChatSession {
        provider: args.provider.clone(),
        model: args.model.clone(),
        chat_id: None,
        attachments: Vec::new(),
        last_message_id: None,
        last_generation_id: None,
    };

    let stdin = io::stdin();
    let mut line = String::new();
    println!("Typix chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_chat_input(&line) {
            ChatInput::Noop => continue,
            ChatInput::Quit => break,
            ChatInput::Help => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            ChatInput::SetProvider(provider) => {
                let Some(first_model) = service
                    .dispatcher()
                    .providers()
                    .get(&provider)
                    .and_then(|found| found.models().list().next().map(|model| model.id.clone()))
                else {
                    println!("Unknown provider '{provider}'");
                    continue;
                };
                session.provider = provider;
                session.model = first_model;
                sync_chat_model(service, &ctx, &session)?;
                println!("Provider set to {} (model {})", session.provider, session.model);
            }
            ChatInput::SetModel(model) => {
                if !service
                    .dispatcher()
                    .providers()
                    .contains_model(&session.provider, &model)
                {
                    println!(
                        "Model '{model}' not found for provider '{}'",
                        session.provider
                    );
                    continue;
                }
                session.model = model;
                sync_chat_model(service, &ctx, &session)?;
                println!("Model set to {}", session.model);
            }
            ChatInput::Attach(paths) => {
                if paths.is_empty() {
                    println!("/attach requires at least one path");
                    continue;
                }
                for path in paths {
                    match read_attachment(Path::new(&path)) {
                        Ok(attachment) => session.attachments.push(attachment),
                        Err(err) => println!("Attach failed: {err:#}"),
                    }
                }
                println!("{} image(s) queued for the next prompt", session.attachments.len());
            }
            ChatInput::Regenerate => {
                let Some(message_id) = session.last_message_id.clone() else {
                    println!("Nothing to regenerate yet");
                    continue;
                };
                match service.regenerate_message(&ctx, &message_id) {
                    Ok(regen) => {
                        println!("Regenerating {}", regen.generation_id);
                        let view =
                            wait_for_generation(service, &ctx, &regen.generation_id, timeout)?;
                        print_generation(&view);
                    }
                    Err(err) => println!("Regenerate failed: {err}"),
                }
            }
            ChatInput::Status => {
                let Some(generation_id) = session.last_generation_id.as_deref() else {
                    println!("No generation yet");
                    continue;
                };
                match service.get_generation_status(&ctx, generation_id)? {
                    Some(view) => print_generation(&view),
                    None => println!("Generation {generation_id} not found"),
                }
            }
            ChatInput::Unknown { command, .. } => {
                println!("Unknown command /{command}. Type /help for commands.");
            }
            ChatInput::Prompt(prompt) => {
                let chat_id = match session.chat_id.clone() {
                    Some(chat_id) => chat_id,
                    None => {
                        let created = service.create_chat(
                            &ctx,
                            CreateChat {
                                title: Some(truncate_title(&prompt)),
                                provider: session.provider.clone(),
                                model: session.model.clone(),
                                content: None,
                                attachments: Vec::new(),
                            },
                        )?;
                        session.chat_id = Some(created.id.clone());
                        created.id
                    }
                };
                let created = match service.create_message(
                    &ctx,
                    CreateMessage {
                        chat_id,
                        content: prompt,
                        kind: MessageType::Text,
                        provider: session.provider.clone(),
                        model: session.model.clone(),
                        attachments: std::mem::take(&mut session.attachments),
                    },
                ) {
                    Ok(created) => created,
                    Err(err) => {
                        println!("Message rejected: {err}");
                        continue;
                    }
                };
                session.last_message_id = Some(created.assistant_message.message.id.clone());
                let Some(generation_id) = created.generation_id().map(str::to_string) else {
                    continue;
                };
                session.last_generation_id = Some(generation_id.clone());
                let view = wait_for_generation(service, &ctx, &generation_id, timeout)?;
                print_generation(&view);
            }
        }
    }

    engine.shutdown()
}

fn sync_chat_model(service: &ChatService, ctx: &RequestContext, session: &ChatSession) -> Result<()> {
    let Some(chat_id) = session.chat_id.clone() else {
        return Ok(());
    };
    service.update_chat(
        ctx,
        UpdateChat {
            id: chat_id,
            title: None,
            provider: Some(session.provider.clone()),
            model: Some(session.model.clone()),
        },
    )?;
    Ok(())
}

fn wait_for_generation(
    service: &ChatService,
    ctx: &RequestContext,
    generation_id: &str,
    timeout: Duration,
) -> Result<GenerationView> {
    let deadline = Instant::now() + timeout;
    loop {
        let view = service
            .get_generation_status(ctx, generation_id)?
            .with_context(|| format!("generation {generation_id} disappeared"))?;
        if matches!(
            view.observed_status,
            ObservedStatus::Completed | ObservedStatus::Failed
        ) {
            return Ok(view);
        }
        if Instant::now() >= deadline {
            bail!(
                "generation {generation_id} still pending after {}s",
                timeout.as_secs()
            );
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn print_generation(view: &GenerationView) {
    match view.observed_status {
        ObservedStatus::Completed => {
            let elapsed = view
                .generation
                .generation_time_ms
                .map(|ms| format!(" in {ms} ms"))
                .unwrap_or_default();
            println!(
                "Generated {} image(s){elapsed} with {}/{}",
                view.result_urls.len(),
                view.generation.provider,
                view.generation.model
            );
            for url in &view.result_urls {
                println!("  {url}");
            }
        }
        ObservedStatus::Failed => {
            let reason = view
                .generation
                .error_reason
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            println!("Generation failed: {reason}");
        }
        status => {
            println!(
                "Generation {}: {}",
                view.generation.id,
                json!(status).as_str().unwrap_or("pending")
            );
        }
    }
}

fn read_attachment(path: &Path) -> Result<AttachmentInput> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if data_uri::sniff_mime(&bytes).is_none() {
        bail!("{} is not a PNG, JPEG, WebP or GIF image", path.display());
    }
    Ok(AttachmentInput::image(data_uri::encode_sniffed(&bytes)))
}

fn truncate_title(prompt: &str) -> String {
    const MAX_TITLE_CHARS: usize = 48;
    let trimmed = prompt.trim();
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }
    let mut title = trimmed.chars().take(MAX_TITLE_CHARS - 3).collect::<String>();
    title.push_str("...");
    title
}
