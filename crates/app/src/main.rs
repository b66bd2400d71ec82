use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use knowall_core::config::{DEFAULT_API_BASE, DEFAULT_CHAT_MODEL, DEFAULT_COLLECTION, DEFAULT_EMBEDDING_MODEL, DEFAULT_INDEX_PATH};
use knowall_core::{
    parse_answer, parse_base_url, AnswerGenerator, AnswerOptions, CharacterNgramEmbedder, ChunkingConfig,
    Embedder, FailurePolicy, IngestionOptions, IngestionPipeline, LocalVectorIndex, OpenAiChatModel,
    OpenAiConfig, OpenAiEmbedder, QdrantStore, Retriever, RetryPolicy, StreamEvent, VectorIndex, WriteMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "knowall", version, about = "Ask grounded questions about your documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, global = true, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// API key for the OpenAI-compatible API
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, global = true, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, global = true, default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    /// Sampling temperature for answers
    #[arg(long, global = true, default_value_t = 0.2)]
    temperature: f32,

    /// Which embedder turns text into vectors
    #[arg(long, global = true, value_enum, default_value_t = EmbedderKind::Openai)]
    embedder: EmbedderKind,

    #[arg(long, global = true, value_enum, default_value_t = IndexBackend::Local)]
    index_backend: IndexBackend,

    /// Directory holding local collections
    #[arg(long, global = true, default_value = DEFAULT_INDEX_PATH)]
    index_path: PathBuf,

    #[arg(long, global = true, default_value = DEFAULT_COLLECTION)]
    collection: String,

    /// Qdrant base URL
    #[arg(long, global = true, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Vector size of the Qdrant collection when using the openai embedder
    #[arg(long, global = true, default_value_t = 1536)]
    embedding_dimensions: usize,

    #[arg(long, global = true, value_enum, default_value_t = WriteModeArg::Upsert)]
    write_mode: WriteModeArg,

    /// Retries for rate-limited or failing service calls
    #[arg(long, global = true, default_value_t = 2)]
    max_retries: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a document or every supported document in a folder.
    Ingest {
        /// File or folder (pdf, docx, txt).
        path: PathBuf,
        /// Chunks embedded and stored per request.
        #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u16).range(8..=256))]
        batch_size: u16,
        /// Read at most this many PDF pages per file.
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long, default_value_t = knowall_core::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, default_value_t = knowall_core::DEFAULT_CHUNK_OVERLAP)]
        overlap: usize,
        /// Stop at the first file that fails instead of skipping it.
        #[arg(long, default_value_t = false)]
        fail_fast: bool,
    },
    /// Answer a question from the indexed documents.
    Ask {
        #[arg(value_parser = parse_question)]
        question: String,
        /// Number of chunks used as context.
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
        top_k: u8,
        /// Print the answer while it is generated.
        #[arg(long, default_value_t = false)]
        stream: bool,
        /// Print the model output as is.
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    Openai,
    Ngram,
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexBackend {
    Local,
    Qdrant,
}

#[derive(Clone, Copy, ValueEnum)]
enum WriteModeArg {
    Upsert,
    Append,
}

impl From<WriteModeArg> for WriteMode {
    fn from(value: WriteModeArg) -> Self {
        match value {
            WriteModeArg::Upsert => WriteMode::Upsert,
            WriteModeArg::Append => WriteMode::Append,
        }
    }
}

fn parse_question(raw: &str) -> Result<String, String> {
    let question = raw.trim();
    if question.chars().count() < 2 {
        return Err("question must be at least 2 characters".to_string());
    }
    Ok(question.to_string())
}

impl Cli {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    fn openai_config(&self) -> anyhow::Result<OpenAiConfig> {
        parse_base_url(&self.api_base)?;
        Ok(OpenAiConfig {
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone(),
            embedding_model: self.embedding_model.clone(),
            chat_model: self.chat_model.clone(),
            retry: self.retry(),
        })
    }

    fn embedder(&self) -> anyhow::Result<(Arc<dyn Embedder>, usize)> {
        match self.embedder {
            EmbedderKind::Openai => {
                if self.api_key.is_none() {
                    warn!("no API key configured, embedding requests will be unauthenticated");
                }
                let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(self.openai_config()?));
                Ok((embedder, self.embedding_dimensions))
            }
            EmbedderKind::Ngram => {
                let embedder = CharacterNgramEmbedder::default();
                let dimensions = embedder.dimensions;
                let embedder: Arc<dyn Embedder> = Arc::new(embedder);
                Ok((embedder, dimensions))
            }
        }
    }

    async fn index(&self, dimensions: usize) -> anyhow::Result<Arc<dyn VectorIndex>> {
        let write_mode = WriteMode::from(self.write_mode);
        let index: Arc<dyn VectorIndex> = match self.index_backend {
            IndexBackend::Local => {
                Arc::new(LocalVectorIndex::open(&self.index_path, &self.collection, write_mode).await?)
            }
            IndexBackend::Qdrant => {
                parse_base_url(&self.qdrant_url)?;
                let store = QdrantStore::new(&self.qdrant_url, &self.collection, dimensions, write_mode)
                    .with_retry(self.retry());
                store.ensure_collection().await?;
                Arc::new(store)
            }
        };
        Ok(index)
    }
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
        "knowall boot"
    );

    let (embedder, dimensions) = cli.embedder()?;
    let index = cli.index(dimensions).await?;

    match &cli.command {
        Command::Ingest {
            path,
            batch_size,
            max_pages,
            chunk_size,
            overlap,
            fail_fast,
        } => {
            let options = IngestionOptions {
                chunking: ChunkingConfig::new(*chunk_size, *overlap)?,
                batch_size: usize::from(*batch_size),
                max_pages: *max_pages,
                failure_policy: if *fail_fast {
                    FailurePolicy::Abort
                } else {
                    FailurePolicy::SkipAndReport
                },
            };
            let pipeline = IngestionPipeline::new(embedder, index.clone(), options);
            let report = pipeline.ingest_path(path).await?;

            for file in &report.ingested {
                println!("{}: {} chunks in {} batches", file.source, file.chunk_count(), file.batches);
            }
            if !report.skipped.is_empty() {
                warn!(skipped = report.skipped.len(), path = %path.display(), "some files were skipped");
                for skipped in &report.skipped {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
            }

            let elapsed = report.finished_at - report.started_at;
            println!(
                "{} chunks from {} files ingested in {} ms ({} records in {})",
                report.total_chunks(),
                report.ingested.len(),
                elapsed.num_milliseconds(),
                index.count().await?,
                cli.collection
            );
        }
        Command::Ask {
            question,
            top_k,
            stream,
            raw,
        } => {
            let model = Arc::new(OpenAiChatModel::new(cli.openai_config()?));
            let options = AnswerOptions {
                temperature: cli.temperature,
                ..AnswerOptions::default()
            };
            let generator = AnswerGenerator::new(Retriever::new(embedder, index), model, options);
            let k = usize::from(*top_k);

            if *stream {
                let mut events = Box::pin(generator.stream_answer(question, k).await?);
                let mut stdout = tokio::io::stdout();
                let mut output = String::new();
                let mut sources = Vec::new();

                while let Some(event) = events.next().await {
                    match event? {
                        StreamEvent::Token(token) => {
                            stdout.write_all(token.as_bytes()).await?;
                            stdout.flush().await?;
                            output.push_str(&token);
                        }
                        StreamEvent::Sources(list) => sources = list,
                        StreamEvent::Done => break,
                    }
                }
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;

                if !*raw {
                    println!("\n{}", parse_answer(&output).render_markdown());
                }
                print_sources(&sources);
            } else {
                let answer = generator.answer(question, k).await?;
                if *raw {
                    println!("{}", answer.raw);
                } else {
                    println!("{}", answer.parsed().render_markdown());
                }
                print_sources(&answer.sources());
            }
        }
    }

    Ok(())
}

fn print_sources(sources: &[String]) {
    if sources.is_empty() {
        return;
    }
    println!("\nSources:");
    for source in sources {
        println!("- {source}");
    }
}
