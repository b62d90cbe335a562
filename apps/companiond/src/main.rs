use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use companion_kernel::{CompanionBuilder, CompanionKernel, CompletionBackend, EmbeddingBackend};
use companion_protocol::{ConversationId, SessionId, UserId};
use companion_providers::{
    DEFAULT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_DIMENSION, DEFAULT_EMBEDDING_MODEL, OpenAiConfig,
};
use companion_runtime::{ChatSession, RuntimeConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "companiond")]
#[command(about = "Student companion: emotion-aware chat with a self-growing knowledge base")]
struct Cli {
    #[arg(long, env = "COMPANION_ROOT", default_value = ".companion")]
    root: PathBuf,

    #[command(flatten)]
    providers: ProviderArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ProviderArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    model: String,

    #[arg(long, env = "TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, env = "MAX_TOKENS", default_value_t = 1000)]
    max_tokens: u32,

    /// Exchanges kept in the prompt context.
    #[arg(long, env = "MAX_CONVERSATION_HISTORY", default_value_t = 10)]
    history_window: usize,

    #[arg(long, default_value_t = 3)]
    top_k: usize,

    /// Embed through the remote `/embeddings` endpoint instead of the
    /// local hashing embedder.
    #[arg(long)]
    remote_embeddings: bool,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSION", default_value_t = DEFAULT_DIMENSION)]
    embedding_dimension: usize,

    /// Answer without knowledge retrieval.
    #[arg(long)]
    no_rag: bool,
}

impl ProviderArgs {
    fn openai(&self, model: &str) -> OpenAiConfig {
        let config = OpenAiConfig::new(model).with_base_url(&self.base_url);
        match &self.api_key {
            Some(key) => config.with_api_key(key.clone()),
            None => config,
        }
    }

    fn builder(&self, root: PathBuf) -> CompanionBuilder {
        let runtime = RuntimeConfig {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            history_window: self.history_window,
            top_k: self.top_k,
            rag_enabled: !self.no_rag,
            ..RuntimeConfig::default()
        };
        let embedding = if self.remote_embeddings {
            EmbeddingBackend::OpenAi {
                config: self.openai(&self.embedding_model),
                dimension: self.embedding_dimension,
            }
        } else {
            EmbeddingBackend::Hashing {
                dimension: self.embedding_dimension,
            }
        };
        CompanionBuilder::new(root)
            .runtime_config(runtime)
            .embedding(embedding)
            .completion(CompletionBackend::OpenAi(self.openai(&self.model)))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat on stdin.
    Chat {
        #[arg(long)]
        user: Option<String>,
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
    },
    /// Load knowledge. The initial corpus is loaded automatically when the
    /// store is empty.
    Seed {
        #[arg(long)]
        extended: bool,
    },
    /// Re-mine high-scoring history into the knowledge store.
    Learn {
        #[arg(long, default_value_t = 4.0)]
        min_score: f64,
    },
    /// Print statistics for one session as JSON.
    Stats { session: String },
    /// Print knowledge store details as JSON.
    Count,
    /// Delete every knowledge document.
    ResetKnowledge {
        #[arg(long)]
        yes: bool,
    },
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq)]
enum ReplCommand {
    Message(String),
    Feedback { score: f64, text: Option<String> },
    Stats,
    Pattern,
    Learn,
    Reset,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Message(line.to_owned());
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).filter(|rest| !rest.is_empty());
    match name {
        "feedback" => {
            let Some(rest) = rest else {
                return ReplCommand::Invalid("usage: /feedback <1-5> [text]".into());
            };
            let mut args = rest.splitn(2, char::is_whitespace);
            let score = args.next().unwrap_or_default();
            match score.parse::<f64>() {
                Ok(score) => ReplCommand::Feedback {
                    score,
                    text: args
                        .next()
                        .map(str::trim)
                        .filter(|text| !text.is_empty())
                        .map(str::to_owned),
                },
                Err(_) => ReplCommand::Invalid(format!("not a score: {score}")),
            }
        }
        "stats" => ReplCommand::Stats,
        "pattern" => ReplCommand::Pattern,
        "learn" => ReplCommand::Learn,
        "reset" => ReplCommand::Reset,
        "quit" | "exit" => ReplCommand::Quit,
        other => ReplCommand::Invalid(format!("unknown command /{other}")),
    }
}

const REPL_HELP: &str =
    "commands: /feedback <1-5> [text], /stats, /pattern, /learn, /reset, /quit";

async fn run_chat(
    kernel: &CompanionKernel,
    user: Option<UserId>,
    session: Option<SessionId>,
) -> Result<()> {
    let orchestrator = kernel.orchestrator();
    let mut chat: ChatSession = match session {
        Some(session_id) => orchestrator.resume(&session_id).await?,
        None => orchestrator.start_session(user).await?,
    };
    let mut last_conversation: Option<ConversationId> = None;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if let Some(session_id) = chat.session_id() {
        println!("session {session_id}");
    }
    println!("{REPL_HELP}");

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_command(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Invalid(message) => println!("{message}\n{REPL_HELP}"),
            ReplCommand::Message(message) => match chat.chat(&message).await {
                Ok(reply) => {
                    if !reply.detected_emotions.is_empty() {
                        let labels: Vec<&str> = reply
                            .detected_emotions
                            .iter()
                            .map(|emotion| emotion.label())
                            .collect();
                        println!("[{}] {} refs", labels.join(", "), reply.rag_docs_count);
                    }
                    println!("{}", reply.response);
                    last_conversation = Some(reply.conversation_id);
                }
                Err(error) => println!("error: {error}"),
            },
            ReplCommand::Feedback { score, text } => {
                let Some(conversation_id) = last_conversation else {
                    println!("nothing to rate yet");
                    continue;
                };
                match orchestrator.add_feedback(conversation_id, score, text).await {
                    Ok(_) => println!("feedback recorded for #{conversation_id}"),
                    Err(error) => println!("error: {error}"),
                }
            }
            ReplCommand::Stats => match chat.session_id() {
                Some(session_id) => match orchestrator.session_statistics(session_id).await? {
                    Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                    None => println!("no statistics yet"),
                },
                None => println!("no session yet"),
            },
            ReplCommand::Pattern => match chat.session_id() {
                Some(session_id) => {
                    let pattern = orchestrator.emotion_pattern(session_id).await?;
                    println!("{}", serde_json::to_string_pretty(&pattern)?);
                }
                None => println!("no session yet"),
            },
            ReplCommand::Learn => match orchestrator
                .trigger_learning(orchestrator.config().quality_threshold)
                .await
            {
                Ok(learned) => println!("learned {learned} documents"),
                Err(error) => println!("error: {error}"),
            },
            ReplCommand::Reset => {
                let session_id = chat.reset(chat.user_id().cloned()).await?;
                last_conversation = None;
                println!("new session {session_id}");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    if cli.providers.api_key.is_none() {
        warn!("OPENAI_API_KEY not set; completion requests will be unauthenticated");
    }

    if let Command::ResetKnowledge { yes: false } = cli.command {
        bail!("refusing to delete the knowledge store without --yes");
    }

    let kernel = cli
        .providers
        .builder(cli.root.clone())
        .build()
        .await
        .with_context(|| format!("failed starting companion under {:?}", cli.root))?;
    info!(root = %cli.root.display(), "companion ready");

    match cli.command {
        Command::Chat { user, session } => {
            run_chat(
                &kernel,
                user.map(UserId::from_string),
                session.map(SessionId::from_string),
            )
            .await?;
        }
        Command::Seed { extended } => {
            if extended {
                let inserted = kernel.seed_extended().await?;
                println!("inserted {inserted} documents");
            }
            println!(
                "knowledge store holds {} documents",
                kernel.orchestrator().knowledge_count().await?
            );
        }
        Command::Learn { min_score } => {
            let learned = kernel.orchestrator().trigger_learning(min_score).await?;
            println!("learned {learned} documents");
        }
        Command::Stats { session } => {
            let session_id = SessionId::from_string(session);
            match kernel.orchestrator().session_statistics(&session_id).await? {
                Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                None => bail!("unknown session {session_id}"),
            }
        }
        Command::Count => {
            let info = kernel.orchestrator().knowledge_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::ResetKnowledge { .. } => {
            kernel.reset_knowledge().await?;
            println!("knowledge store cleared");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_command("  最近压力很大  "),
            ReplCommand::Message("最近压力很大".into())
        );
        assert_eq!(parse_command("   "), ReplCommand::Empty);
    }

    #[test]
    fn feedback_takes_score_and_optional_text() {
        assert_eq!(
            parse_command("/feedback 5 很有帮助"),
            ReplCommand::Feedback {
                score: 5.0,
                text: Some("很有帮助".into())
            }
        );
        assert_eq!(
            parse_command("/feedback 3"),
            ReplCommand::Feedback {
                score: 3.0,
                text: None
            }
        );
        assert!(matches!(parse_command("/feedback"), ReplCommand::Invalid(_)));
        assert!(matches!(
            parse_command("/feedback great"),
            ReplCommand::Invalid(_)
        ));
    }

    #[test]
    fn slash_commands_are_recognized() {
        assert_eq!(parse_command("/stats"), ReplCommand::Stats);
        assert_eq!(parse_command("/pattern"), ReplCommand::Pattern);
        assert_eq!(parse_command("/learn"), ReplCommand::Learn);
        assert_eq!(parse_command("/reset"), ReplCommand::Reset);
        assert_eq!(parse_command("/exit"), ReplCommand::Quit);
        assert!(matches!(parse_command("/dance"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn cli_maps_flags_onto_runtime_config() {
        let cli = Cli::parse_from([
            "companiond",
            "--root",
            "/tmp/companion",
            "--history-window",
            "4",
            "--no-rag",
            "stats",
            "abc",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/companion"));
        assert_eq!(cli.providers.history_window, 4);
        assert!(cli.providers.no_rag);
        assert!(matches!(cli.command, Command::Stats { ref session } if session == "abc"));
        let rendered = format!("{:?}", cli.providers.builder(cli.root.clone()));
        assert!(rendered.contains("history_window: 4"));
        assert!(rendered.contains("rag_enabled: false"));
    }

    #[test]
    fn reset_requires_explicit_flag() {
        let cli = Cli::parse_from(["companiond", "reset-knowledge"]);
        assert!(matches!(cli.command, Command::ResetKnowledge { yes: false }));
    }
}
