use anyhow::Context;
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamrag_core::relay::replay;
use streamrag_core::{
    BackendKind, ChainSettings, CharacterNgramEmbedder, Chunker, ChunkingConfig, Classify,
    CompletionBackend, DeliveryMode, DocumentLoader, EmbeddingBackend, EmbeddingCache,
    FsObjectStore, HttpCompletionBackend, HttpEmbeddingBackend, HttpObjectStore,
    InvocationStrategy, Invoker, KnowledgeBase, ObjectStore, RelayConfig, ResponseRelay,
    RetrievalChain, WriterSink,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "streamrag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Completion endpoint for the primary backend.
    #[arg(long, env = "STREAMRAG_PRIMARY_URL", default_value = "http://localhost:8080")]
    primary_url: String,

    /// Completion endpoint for the secondary backend (defaults to the primary one).
    #[arg(long, env = "STREAMRAG_SECONDARY_URL")]
    secondary_url: Option<String>,

    /// Embedding endpoint (defaults to the primary completion endpoint).
    #[arg(long, env = "STREAMRAG_EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[arg(long, env = "STREAMRAG_EMBEDDING_DIMENSIONS", default_value_t = 1536)]
    embedding_dimensions: usize,

    /// Embed with the offline character n-gram embedder.
    #[arg(long, env = "STREAMRAG_LOCAL_EMBEDDINGS", default_value_t = false)]
    local_embeddings: bool,

    /// Object storage: an http(s) endpoint or a local directory.
    #[arg(long, env = "STREAMRAG_STORAGE", default_value = ".")]
    storage: String,

    #[arg(long, env = "RAG_BUCKET", default_value = "")]
    bucket: String,

    #[arg(long, env = "STREAMRAG_KEY_PREFIX", default_value = "rag/")]
    key_prefix: String,

    /// primary | secondary
    #[arg(long, env = "STREAMRAG_BACKEND", default_value = "primary")]
    backend: BackendKind,

    #[arg(long, env = "STREAMRAG_STREAMING", default_value_t = true, action = ArgAction::Set)]
    streaming: bool,

    #[arg(long, env = "STREAMRAG_COMPLETION_MODEL", default_value = "anthropic.claude-v2")]
    completion_model: String,

    #[arg(long, env = "STREAMRAG_EMBEDDING_MODEL", default_value = "amazon.titan-embed-text-v1")]
    embedding_model: String,

    #[arg(long, env = "STREAMRAG_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: u32,

    #[arg(long, env = "STREAMRAG_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Capacity of the queue bridging push-style backends.
    #[arg(long, env = "STREAMRAG_DRAIN_CAPACITY", default_value_t = 64)]
    drain_capacity: usize,

    #[arg(long, env = "STREAMRAG_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
}

#[derive(Args)]
struct SourceArgs {
    /// Object key of the source document, relative to the key prefix.
    #[arg(long, env = "RAG_SOURCE_FILE")]
    source: String,

    #[arg(long, env = "STREAMRAG_CHUNK_SIZE", default_value_t = 512)]
    chunk_size: usize,

    #[arg(long, env = "STREAMRAG_CHUNK_OVERLAP", default_value_t = 0)]
    chunk_overlap: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Load the source document, index it and stream an answer to stdout.
    Ask {
        #[command(flatten)]
        source: SourceArgs,
        /// Number of chunks placed in the prompt context.
        #[arg(long, env = "STREAMRAG_TOP_K", default_value_t = 4)]
        top_k: usize,
        question: String,
    },
    /// Send a prompt straight to the completion backend.
    Invoke {
        /// Write the prompt to stdout before the answer.
        #[arg(long, default_value_t = false)]
        echo_prompt: bool,
        prompt: String,
    },
    /// Print the chunks the source document splits into.
    Chunks {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Relay messages without a model, one per line.
    Echo {
        /// Pause between writes in loop mode.
        #[arg(long, default_value_t = 50)]
        pause_ms: u64,
        /// Join the messages and write them once.
        #[arg(long, default_value_t = false)]
        pipeline: bool,
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

impl Cli {
    fn relay_config(&self, source: Option<&SourceArgs>, top_k: Option<usize>) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            source_bucket: self.bucket.clone(),
            source_key: source.map(|args| args.source.clone()).unwrap_or_default(),
            key_prefix: self.key_prefix.clone(),
            chunk_size: source.map_or(defaults.chunk_size, |args| args.chunk_size),
            chunk_overlap: source.map_or(defaults.chunk_overlap, |args| args.chunk_overlap),
            top_k: top_k.unwrap_or(defaults.top_k),
            backend: self.backend,
            streaming: self.streaming,
            completion_model: self.completion_model.clone(),
            embedding_model: self.embedding_model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            drain_capacity: self.drain_capacity,
            scratch_dir: self.scratch_dir.clone().unwrap_or(defaults.scratch_dir),
        }
    }

    fn object_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        if self.storage.starts_with("http://") || self.storage.starts_with("https://") {
            Ok(Arc::new(HttpObjectStore::new(&self.storage)?))
        } else {
            Ok(Arc::new(FsObjectStore::new(&self.storage)))
        }
    }

    fn embedding_backend(&self) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
        if self.local_embeddings {
            return Ok(Arc::new(CharacterNgramEmbedder::default()));
        }
        let endpoint = self.embedding_url.as_deref().unwrap_or(&self.primary_url);
        Ok(Arc::new(HttpEmbeddingBackend::new(
            endpoint,
            self.embedding_model.clone(),
            self.embedding_dimensions,
        )?))
    }

    fn invoker(&self, config: &RelayConfig) -> anyhow::Result<Invoker> {
        let primary: Arc<dyn CompletionBackend> =
            Arc::new(HttpCompletionBackend::new("primary", &self.primary_url)?);
        let secondary: Arc<dyn CompletionBackend> = match &self.secondary_url {
            Some(url) => Arc::new(HttpCompletionBackend::new("secondary", url)?),
            None => Arc::clone(&primary),
        };
        Ok(Invoker::new(primary, secondary).with_drain_capacity(config.drain_capacity))
    }
}

fn stdout_relay(mode: DeliveryMode) -> ResponseRelay<WriterSink<tokio::io::Stdout>> {
    ResponseRelay::new(WriterSink::new(tokio::io::stdout()), mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        backend = %cli.backend,
        "streamrag boot"
    );

    match &cli.command {
        Command::Ask {
            source,
            top_k,
            question,
        } => {
            let config = cli.relay_config(Some(source), Some(*top_k));
            let loader = DocumentLoader::from_config(cli.object_store()?, &config);
            let cache = EmbeddingCache::new(cli.embedding_backend()?);
            let knowledge = KnowledgeBase::cold_start(
                &loader,
                &config.source_key,
                ChunkingConfig::from(&config),
                &cache,
            )
            .await
            .with_context(|| format!("cold start failed for {}", config.source_key))?;

            let invoker = cli.invoker(&config)?;
            let chain = RetrievalChain::new(
                &cache,
                &knowledge.index,
                &invoker,
                ChainSettings::from(&config),
            );

            let mut relay = stdout_relay(DeliveryMode::Incremental);
            match chain.answer(question, &mut relay).await {
                Ok(summary) => {
                    let stats = cache.stats();
                    info!(
                        chunks = summary.chunks,
                        bytes = summary.bytes,
                        cache_hits = stats.hits,
                        cache_misses = stats.misses,
                        "answer relayed"
                    );
                }
                Err(error) => {
                    warn!(kind = %error.kind(), "answer failed");
                    return Err(error.into());
                }
            }
        }
        Command::Invoke {
            echo_prompt,
            prompt,
        } => {
            let config = cli.relay_config(None, None);
            let invoker = cli.invoker(&config)?;
            let request = config.completion_request(prompt.as_str());
            let mode = DeliveryMode::for_strategy(InvocationStrategy::for_request(&request));

            let mut relay = stdout_relay(mode);
            if *echo_prompt {
                relay.preamble(&format!("{prompt}\n")).await?;
            }

            let invocation = invoker.invoke(&request);
            info!(invocation = %invocation.id(), strategy = ?invocation.strategy(), "invoking");
            let summary = relay.pump(invocation).await.map_err(|error| {
                warn!(kind = %error.kind(), "invocation failed");
                error
            })?;
            info!(chunks = summary.chunks, bytes = summary.bytes, "completion relayed");
        }
        Command::Chunks { source } => {
            let config = cli.relay_config(Some(source), None);
            let loader = DocumentLoader::from_config(cli.object_store()?, &config);
            let chunker = Chunker::new(ChunkingConfig::from(&config))?;

            let document = loader.load(&config.source_key).await?;
            let chunks = chunker.chunk_document(&document.source_id, &document.text);
            println!(
                "{} chunks from {} (sha256 {})",
                chunks.len(),
                document.source_id,
                document.checksum
            );
            for chunk in chunks {
                println!(
                    "[{}] {} ({} chars)\n{}\n",
                    chunk.ordinal,
                    &chunk.content_hash[..12],
                    chunk.text.chars().count(),
                    chunk.text
                );
            }
        }
        Command::Echo {
            pause_ms,
            pipeline,
            messages,
        } => {
            let mode = if *pipeline {
                DeliveryMode::Buffered
            } else {
                DeliveryMode::Incremental
            };
            let mut relay = stdout_relay(mode);
            let summary = replay(&mut relay, messages, Duration::from_millis(*pause_ms)).await?;
            info!(messages = summary.chunks, bytes = summary.bytes, "echo relayed");
        }
    }

    Ok(())
}
