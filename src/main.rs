use std::io::{BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use sihrag_core::{OutputFormat, QueryHint, ResultEntry, SihragConfig, SihragError};
use sihrag_retrieval::chunker::{Chunker, IngestionReport, SourceDocument};
use sihrag_retrieval::embedding;
use sihrag_retrieval::indexing::{BuildReport, IndexingJob};
use sihrag_retrieval::rerank;
use sihrag_retrieval::search::{BatchEntry, HybridSearch, SearchRequest, SearchSettings};
use sihrag_retrieval::snapshot::{self, IndexHandle};
use sihrag_retrieval::store::ChunkStore;

const CONFIG_FILE: &str = ".sihrag.toml";

#[derive(Parser)]
#[command(
    name = "sihrag",
    version,
    about = "Hybrid search over SIH/SUS manuals, ordinances and SIGTAP annexes",
    long_about = "Hybrid BM25 + embedding retrieval over SIH/SUS regulatory documents.\n\n\
                   Extracted documents are split into parent/child chunks, indexed lexically\n\
                   and semantically, and queried through weighted reciprocal rank fusion.\n\n\
                   Examples:\n  \
                     sihrag init                          Create a .sihrag.toml config file\n  \
                     sihrag chunk extracted.jsonl         Build the chunk store\n  \
                     sihrag index                         Build and persist the index\n  \
                     sihrag search 'diárias de UTI'       Query the index\n  \
                     sihrag search 4.2 --hint section     Look up a manual section"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .sihrag.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable listing (default)\n  \
                         json      Machine-readable JSON\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Create a default .sihrag.toml configuration file
    #[command(long_about = "Create a default .sihrag.toml configuration file.\n\n\
        Every option is listed commented out with its default value.\n\
        Fails if .sihrag.toml already exists.")]
    Init,
    /// Split extracted documents into parent/child chunks
    #[command(long_about = "Split extracted documents into parent/child chunks.\n\n\
        Reads one JSON object per line ({\"id\", \"text\", \"metadata\"}) and writes the\n\
        chunk store to paths.chunks. With --append, documents already in the store\n\
        are replaced and the rest are kept.\n\n\
        Examples:\n  sihrag chunk extracted.jsonl\n  sihrag chunk portarias-2024.jsonl --append")]
    Chunk {
        /// JSON-lines file of extracted documents
        records: PathBuf,

        /// Merge into the existing chunk store instead of replacing it
        #[arg(long)]
        append: bool,
    },
    /// Build the lexical and semantic indexes from the chunk store
    #[command(long_about = "Build the lexical and semantic indexes from the chunk store.\n\n\
        Embeds every leaf chunk with the configured provider and persists the\n\
        snapshot to paths.index. A failed build leaves the previous index in place.")]
    Index,
    /// Query the persisted index
    #[command(long_about = "Query the persisted index.\n\n\
        With several queries, each is run on its own and the best result per chunk\n\
        is kept, labelled with the query that found it.\n\n\
        Examples:\n  sihrag search 'habilitação de leitos de UTI'\n  \
        sihrag search 0301010010 --hint code\n  \
        sihrag search 'OPM compatível' --section 5 --limit 3\n  \
        sihrag search 'diárias de UTI' 'permanência maior' --limit 2")]
    Search {
        /// Query text; more than one runs a batch lookup
        #[arg(required = true)]
        queries: Vec<String>,

        /// Maximum results (per query in batch mode)
        #[arg(long)]
        limit: Option<usize>,

        /// Query kind: section, code or free (default: detected)
        #[arg(long)]
        hint: Option<QueryHint>,

        /// Manual section to pin first, e.g. 4.2
        #[arg(long)]
        section: Option<String>,
    },
}

const DEFAULT_CONFIG: &str = r#"# sihrag configuration
# See: https://github.com/sihrag/sihrag

[chunking]
# parent_max_chars = 3000
# child_max_chars = 500
# overlap_chars = 200
# annex_max_pages = 10
# min_paragraph_chars = 20

[lexical]
# k1 = 1.5
# b = 0.75

[fusion]
# rrf_k = 60.0
# candidate_pool = 20
# free_form = { lexical = 1.0, semantic = 1.0 }
# procedure_code = { lexical = 1.0, semantic = 0.3 }
# section_number = { lexical = 1.0, semantic = 0.5 }

[search]
# default_top_k = 5
# decompose_queries = true
# resolve_parents = true
# auto_filters = true

[embedding]
# provider = "http"  # or "hash" for an offline feature-hashing embedder
# model = "paraphrase-multilingual-MiniLM-L12-v2"
# base_url = "http://localhost:8080/v1"
# api_key = "..."  # or set SIHRAG_EMBEDDING_API_KEY
# dimensions = 384
# batch_size = 32
# concurrency = 4

[rerank]
# provider = "none"  # "http" for a cross-encoder /rerank endpoint, "overlap" offline
# model = "cross-encoder/ms-marco-MiniLM-L-6-v2"
# base_url = "http://localhost:8081"
# api_key = "..."  # or set SIHRAG_RERANK_API_KEY
# pool_size = 20
# pool_factor = 3

[paths]
# chunks = "data/chunks.json"
# index = "data/index.db"
"#;

fn load_config(explicit: Option<&Path>) -> Result<SihragConfig> {
    let config = match explicit {
        Some(path) => SihragConfig::from_file(path)
            .wrap_err_with(|| format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                SihragConfig::from_file(default_path).wrap_err("loading .sihrag.toml")?
            } else {
                SihragConfig::default()
            }
        }
    };
    Ok(config)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn spinner(message: &'static str) -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
    {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    Some(pb)
}

fn read_records(path: &Path) -> Result<Vec<SourceDocument>> {
    let file = std::fs::File::open(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("opening {}", path.display()))?;
    let mut documents = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.into_diagnostic()?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: SourceDocument = serde_json::from_str(&line)
            .into_diagnostic()
            .wrap_err_with(|| format!("{}:{}: malformed document record", path.display(), n + 1))?;
        documents.push(doc);
    }
    Ok(documents)
}

fn print_ingestion(report: &IngestionReport, store: &ChunkStore, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("## Chunking\n");
            println!("| Documents | Chunks | Store total |");
            println!("|-----------|--------|-------------|");
            println!("| {} | {} | {} |", report.documents, report.chunks, store.len());
            if !report.events.is_empty() {
                println!("\n### Events\n");
                for event in &report.events {
                    println!("- {event}");
                }
            }
        }
        OutputFormat::Text => {
            println!(
                "Chunked {} documents into {} chunks ({} in store)",
                report.documents,
                report.chunks,
                store.len()
            );
            for event in &report.events {
                println!("  ! {event}");
            }
        }
    }
    Ok(())
}

fn print_build(report: &BuildReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("## Index v{}\n", report.version);
            println!("- Documents: {}", report.documents);
            println!("- Chunks: {} ({} indexed)", report.chunks, report.indexed);
            println!("- Embedding model: `{}`", report.embedding_model);
            println!("- Built in {} ms", report.elapsed_ms);
        }
        OutputFormat::Text => {
            println!(
                "Index v{}: {} chunks from {} documents ({} indexed, model {}) in {} ms",
                report.version,
                report.chunks,
                report.documents,
                report.indexed,
                report.embedding_model,
                report.elapsed_ms
            );
            if let Some(path) = &report.persisted_to {
                println!("Saved to {}", path.display());
            }
        }
    }
    Ok(())
}

fn location(entry: &ResultEntry) -> String {
    let mut parts = vec![entry.source_document.clone()];
    match (&entry.section, &entry.title) {
        (Some(section), Some(title)) => parts.push(format!("Seção {section} {title}")),
        (Some(section), None) => parts.push(format!("Seção {section}")),
        (None, Some(title)) => parts.push(title.clone()),
        (None, None) => {}
    }
    if let Some(page) = entry.page {
        parts.push(format!("p. {page}"));
    }
    parts.join(" | ")
}

fn ranks(entry: &ResultEntry) -> String {
    let rank = |r: Option<usize>| r.map_or_else(|| "-".to_string(), |r| format!("#{r}"));
    format!(
        "lexical {}, semantic {}",
        rank(entry.lexical_rank),
        rank(entry.semantic_rank)
    )
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn print_results(query: &str, results: &[ResultEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("## Results for \"{query}\"\n");
            if results.is_empty() {
                println!("No results.");
            }
            for (i, entry) in results.iter().enumerate() {
                println!(
                    "### {}. {} (score {:.4})\n",
                    i + 1,
                    location(entry),
                    entry.fused_score
                );
                println!("> {}\n", excerpt(&entry.text, 600));
                println!("_{}; chunk `{}`_\n", ranks(entry), entry.chunk_id);
            }
        }
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No results for \"{query}\"");
            }
            for (i, entry) in results.iter().enumerate() {
                println!(
                    "{:>2}. [{:.4}] {}  ({})",
                    i + 1,
                    entry.fused_score,
                    location(entry),
                    ranks(entry)
                );
                println!("    {}", excerpt(&entry.text, 300));
            }
        }
    }
    Ok(())
}

fn print_batch(results: &[BatchEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results).into_diagnostic()?);
        }
        OutputFormat::Markdown => {
            println!("| # | Score | Location | Query |");
            println!("|---|-------|----------|-------|");
            for (i, r) in results.iter().enumerate() {
                println!(
                    "| {} | {:.4} | {} | {} |",
                    i + 1,
                    r.entry.fused_score,
                    location(&r.entry),
                    r.query_origin
                );
            }
        }
        OutputFormat::Text => {
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{:>2}. [{:.4}] {}  <- \"{}\"",
                    i + 1,
                    r.entry.fused_score,
                    location(&r.entry),
                    r.query_origin
                );
                println!("    {}", excerpt(&r.entry.text, 300));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(format = %cli.format, "configuration loaded");

    match cli.command {
        Command::Init => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!(".sihrag.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .sihrag.toml with default configuration");
        }
        Command::Chunk {
            ref records,
            append,
        } => {
            let documents = read_records(records)?;
            if documents.is_empty() {
                miette::bail!(miette::miette!(
                    help = "Each line must be a JSON object with \"id\" and \"text\" fields",
                    "No documents found in {}",
                    records.display()
                ));
            }

            let output = Chunker::new(config.chunking.clone()).chunk_corpus(documents)?;
            let store = if append {
                let mut existing = match ChunkStore::load(&config.paths.chunks) {
                    Ok(store) => store,
                    Err(SihragError::FileNotFound(_)) => ChunkStore::new(),
                    Err(e) => return Err(e.into()),
                };
                existing.append(output.store)?;
                existing
            } else {
                output.store
            };
            store.save(&config.paths.chunks)?;
            tracing::info!(path = %config.paths.chunks.display(), chunks = store.len(), "chunk store saved");
            print_ingestion(&output.report, &store, cli.format)?;
        }
        Command::Index => {
            let store = ChunkStore::load(&config.paths.chunks)
                .wrap_err("run `sihrag chunk` first to build the chunk store")?;
            let embedder = embedding::from_config(&config.embedding)?;
            let job = IndexingJob::from_config(&config, embedder);
            let handle = IndexHandle::new();

            let pb = spinner("Embedding and indexing chunks...");
            let report = job
                .rebuild(&handle, store, Some(&config.paths.index))
                .await
                .inspect_err(|_e| {
                    if let Some(pb) = &pb {
                        pb.finish_with_message("Failed");
                    }
                })?;
            if let Some(pb) = pb {
                pb.finish_with_message("Done");
            }
            print_build(&report, cli.format)?;
        }
        Command::Search {
            ref queries,
            limit,
            hint,
            ref section,
        } => {
            let snapshot = snapshot::load(&config.paths.index)?;
            let embedder = embedding::from_config(&config.embedding)?;
            if snapshot.embedding_model != embedder.name() {
                tracing::warn!(
                    index = %snapshot.embedding_model,
                    configured = embedder.name(),
                    "index was built with a different embedding model"
                );
            }

            let handle = Arc::new(IndexHandle::with_snapshot(snapshot));
            let mut search =
                HybridSearch::new(handle, embedder, SearchSettings::from_config(&config));
            if let Some(reranker) = rerank::from_config(&config.rerank)? {
                search = search.with_reranker(reranker);
            }

            if let [query] = queries.as_slice() {
                let mut request = SearchRequest::new(query.as_str());
                if let Some(limit) = limit {
                    request = request.with_top_k(limit);
                }
                if let Some(hint) = hint {
                    request = request.with_hint(hint);
                }
                if let Some(section) = section {
                    request = request.with_section(section.as_str());
                }
                let results = search.search_request(&request).await?;
                print_results(query, &results, cli.format)?;
            } else {
                if hint.is_some() || section.is_some() {
                    miette::bail!("--hint and --section apply to a single query");
                }
                let per_query = limit.unwrap_or(config.search.default_top_k);
                let results = search.search_batch(queries, per_query).await?;
                print_batch(&results, cli.format)?;
            }
        }
    }

    Ok(())
}
