//! lexrag CLI - local init and admin tool
//!
//! Provides command-line access to:
//! - Store initialization and KB creation
//! - Ingest runs
//! - Retrieval, chat, and record inspection
//! - Keyword-recall diagnostics
//!
//! Usage:
//!   lexrag-cli init [--data-dir <dir>]
//!   lexrag-cli kb create --name <name> [--embed-dim <n>]
//!   lexrag-cli kb list
//!   lexrag-cli ingest --kb <id> --file <path> [--force] [--dry-run]
//!   lexrag-cli search --kb <id> --query <text> [--limit <n>]
//!   lexrag-cli chat --kb <id> --query <text> [--debug]
//!   lexrag-cli records <retrieval|generation|evaluation|node> <id>
//!   lexrag-cli records page <document_id> <page>
//!   lexrag-cli diagnose keyword-recall --kb <id> --keyword <text> [--top-k <n>]
//!
//! Exit code is 0 on success. On failure a stable `status=<word>` line is
//! printed to stderr.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use lexrag::audit::AuditLog;
use lexrag::chat::{ChatContext, ChatRequest};
use lexrag::db::{now_rfc3339, Database, KnowledgeBase};
use lexrag::error::CoreError;
use lexrag::evaluator::keyword_recall_diagnostics;
use lexrag::kb::embeddings::EmbeddingRegistry;
use lexrag::kb::ingest::{IngestProfile, IngestRequest};
use lexrag::kb::vectors::{VectorStore, VectorStoreConfig};
use lexrag::llm::ProviderRegistry;
use lexrag::validation::normalize_kb_id;
use lexrag::{CancelFlag, CoreState};

const DEFAULT_DATA_DIR: &str = "./lexrag-data";
const DEFAULT_EMBED_DIM: usize = 64;

#[derive(Debug)]
enum Command {
    Init,
    Kb(KbCommand),
    Ingest {
        kb_id: String,
        file: PathBuf,
        force: bool,
        dry_run: bool,
    },
    Search {
        kb_id: String,
        query: String,
        limit: usize,
    },
    Chat {
        kb_id: String,
        query: String,
        debug: bool,
    },
    Records {
        kind: String,
        id: String,
    },
    Page {
        document_id: String,
        page: i64,
    },
    Diagnose {
        kb_id: String,
        keyword: String,
        top_k: usize,
    },
    Help,
    Version,
}

#[derive(Debug)]
enum KbCommand {
    Create { name: String, embed_dim: usize },
    List,
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let data_dir = flag_value(&args, "--data-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    match parse_args(&args) {
        Ok(Command::Help) => {
            print_help();
            ExitCode::SUCCESS
        }
        Ok(Command::Version) => {
            println!("lexrag-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Ok(cmd) => match run_command(cmd, &data_dir) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("status={}", e.status_word());
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("status=bad_request");
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),

        "init" => Ok(Command::Init),

        "kb" => {
            if args.len() < 3 {
                return Err("Missing kb subcommand. Use: create, list".to_string());
            }
            match args[2].as_str() {
                "create" => {
                    let name = flag_value(args, "--name")
                        .ok_or("kb create requires --name".to_string())?;
                    let embed_dim = flag_value(args, "--embed-dim")
                        .map(|v| v.parse::<usize>().map_err(|_| "invalid --embed-dim"))
                        .transpose()?
                        .unwrap_or(DEFAULT_EMBED_DIM);
                    Ok(Command::Kb(KbCommand::Create { name, embed_dim }))
                }
                "list" => Ok(Command::Kb(KbCommand::List)),
                other => Err(format!("Unknown kb subcommand: {}", other)),
            }
        }

        "ingest" => Ok(Command::Ingest {
            kb_id: flag_value(args, "--kb").ok_or("ingest requires --kb".to_string())?,
            file: flag_value(args, "--file")
                .map(PathBuf::from)
                .ok_or("ingest requires --file".to_string())?,
            force: args.iter().any(|a| a == "--force"),
            dry_run: args.iter().any(|a| a == "--dry-run"),
        }),

        "search" => Ok(Command::Search {
            kb_id: flag_value(args, "--kb").ok_or("search requires --kb".to_string())?,
            query: flag_value(args, "--query").ok_or("search requires --query".to_string())?,
            limit: flag_value(args, "--limit")
                .map(|v| v.parse::<usize>().map_err(|_| "invalid --limit"))
                .transpose()?
                .unwrap_or(10),
        }),

        "chat" => Ok(Command::Chat {
            kb_id: flag_value(args, "--kb").ok_or("chat requires --kb".to_string())?,
            query: flag_value(args, "--query").ok_or("chat requires --query".to_string())?,
            debug: args.iter().any(|a| a == "--debug"),
        }),

        "records" => {
            if args.len() < 4 {
                return Err(
                    "records requires a kind and an id: records <retrieval|generation|evaluation|node|page> <id>"
                        .to_string(),
                );
            }
            if args[2] == "page" {
                let page = args
                    .get(4)
                    .ok_or("records page requires <document_id> <page>".to_string())?
                    .parse::<i64>()
                    .map_err(|_| "invalid page number".to_string())?;
                return Ok(Command::Page {
                    document_id: args[3].clone(),
                    page,
                });
            }
            Ok(Command::Records {
                kind: args[2].clone(),
                id: args[3].clone(),
            })
        }

        "diagnose" => {
            if args.get(2).map(String::as_str) != Some("keyword-recall") {
                return Err("Unknown diagnose subcommand. Use: keyword-recall".to_string());
            }
            Ok(Command::Diagnose {
                kb_id: flag_value(args, "--kb").ok_or("diagnose requires --kb".to_string())?,
                keyword: flag_value(args, "--keyword")
                    .ok_or("diagnose requires --keyword".to_string())?,
                top_k: flag_value(args, "--top-k")
                    .map(|v| v.parse::<usize>().map_err(|_| "invalid --top-k"))
                    .transpose()?
                    .unwrap_or(20),
            })
        }

        other => Err(format!("Unknown command: {}", other)),
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn run_command(cmd: Command, data_dir: &PathBuf) -> Result<(), CoreError> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CoreError::internal(e.to_string()))?;
    rt.block_on(run_command_async(cmd, data_dir))
}

async fn run_command_async(cmd: Command, data_dir: &PathBuf) -> Result<(), CoreError> {
    match cmd {
        Command::Init => {
            std::fs::create_dir_all(data_dir)?;
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            let mut vectors = VectorStore::new(vector_config(data_dir, DEFAULT_EMBED_DIM));
            vectors.init().await?;
            println!("Initialized lexrag store at {}", data_dir.display());
            Ok(())
        }

        Command::Kb(KbCommand::Create { name, embed_dim }) => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            let id = normalize_kb_id(&name);
            lexrag::validation::validate_kb_id(&id)?;
            db.insert_kb(&KnowledgeBase {
                id: id.clone(),
                name,
                vector_collection: "nodes".into(),
                embed_provider: "hash".into(),
                embed_model: "hash-v1".into(),
                embed_dim,
                chunk_window: 2,
                min_node_chars: 24,
                created_at: now_rfc3339(),
            })
            .map_err(CoreError::from)?;
            println!("Created KB {}", id);
            Ok(())
        }

        Command::Kb(KbCommand::List) => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            for kb in db.list_kbs().map_err(CoreError::from)? {
                println!(
                    "{}\t{}\t{}/{} dim={}",
                    kb.id, kb.name, kb.embed_provider, kb.embed_model, kb.embed_dim
                );
            }
            Ok(())
        }

        Command::Ingest {
            kb_id,
            file,
            force,
            dry_run,
        } => {
            let state = open_state(data_dir).await?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
            let outcome = state
                .ingest(
                    &IngestRequest {
                        kb_id,
                        source_path: file,
                        file_name,
                        force,
                        dry_run,
                        profile: IngestProfile::default(),
                    },
                    &CancelFlag::new(),
                )
                .await?;
            println!(
                "{}",
                serde_json::json!({
                    "file_id": outcome.file_id,
                    "ingest_status": outcome.ingest_status.as_str(),
                    "node_count": outcome.node_count,
                    "pages": outcome.pages,
                    "short_circuited": outcome.short_circuited,
                    "timing_ms": outcome.timing_ms,
                    "gate": outcome.gate,
                })
            );
            Ok(())
        }

        Command::Search {
            kb_id,
            query,
            limit,
        } => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            lexrag::validation::validate_query(&query)?;
            let hits = db
                .search_nodes_by_keyword(&kb_id, &query, limit)
                .map_err(CoreError::from)?;
            for hit in hits {
                println!(
                    "{:.4}\t{}\tp{}\t{}",
                    hit.score,
                    hit.node_id,
                    hit.page,
                    hit.excerpt.replace('\n', " ")
                );
            }
            Ok(())
        }

        Command::Chat {
            kb_id,
            query,
            debug,
        } => {
            let state = open_state(data_dir).await?;
            let reply = state
                .chat(
                    &ChatRequest {
                        query,
                        kb_id,
                        conversation_id: None,
                        debug,
                        context: ChatContext::default(),
                    },
                    &CancelFlag::new(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&reply).unwrap_or_default());
            Ok(())
        }

        Command::Records { kind, id } => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            let value = match kind.as_str() {
                "retrieval" => {
                    let record = db
                        .get_retrieval_record(&id)
                        .map_err(CoreError::from)?
                        .ok_or_else(|| CoreError::record_not_found("retrieval", &id))?;
                    let hits = db.get_retrieval_hits(&id).map_err(CoreError::from)?;
                    serde_json::json!({ "record": record, "hits": hits })
                }
                "generation" => {
                    let record = db
                        .get_generation_record(&id)
                        .map_err(CoreError::from)?
                        .ok_or_else(|| CoreError::record_not_found("generation", &id))?;
                    serde_json::to_value(record).unwrap_or_default()
                }
                "evaluation" => {
                    let record = db
                        .get_evaluation_record(&id)
                        .map_err(CoreError::from)?
                        .ok_or_else(|| CoreError::record_not_found("evaluation", &id))?;
                    serde_json::to_value(record).unwrap_or_default()
                }
                "node" => {
                    let node = db
                        .get_node(&id)
                        .map_err(CoreError::from)?
                        .ok_or_else(|| CoreError::node_not_found(&id))?;
                    serde_json::to_value(node).unwrap_or_default()
                }
                other => {
                    return Err(CoreError::invalid_input(format!(
                        "Unknown record kind: {}",
                        other
                    )))
                }
            };
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            Ok(())
        }

        Command::Page { document_id, page } => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            let text = db
                .get_page(&document_id, page, 4000)
                .map_err(CoreError::from)?
                .ok_or_else(|| CoreError::record_not_found("page", &document_id))?;
            println!("{}", text);
            Ok(())
        }

        Command::Diagnose {
            kb_id,
            keyword,
            top_k,
        } => {
            let db = open_db(data_dir)?;
            db.initialize().map_err(CoreError::from)?;
            let metrics =
                keyword_recall_diagnostics(&db, &kb_id, &keyword, top_k).map_err(CoreError::from)?;
            println!("{}", serde_json::to_string_pretty(&metrics).unwrap_or_default());
            Ok(())
        }

        Command::Help | Command::Version => unreachable!("handled in main"),
    }
}

fn open_db(data_dir: &PathBuf) -> Result<Database, CoreError> {
    std::fs::create_dir_all(data_dir)?;
    Database::open(&data_dir.join("lexrag.sqlite3")).map_err(CoreError::from)
}

fn vector_config(data_dir: &PathBuf, embed_dim: usize) -> VectorStoreConfig {
    VectorStoreConfig {
        path: data_dir.join("vectors"),
        embedding_dim: embed_dim,
        table_name: "nodes".into(),
    }
}

async fn open_state(data_dir: &PathBuf) -> Result<CoreState, CoreError> {
    let db = open_db(data_dir)?;
    db.initialize().map_err(CoreError::from)?;

    // The vector table dimension follows the first KB; mixed-dimension KBs
    // need separate data dirs
    let embed_dim = db
        .list_kbs()
        .map_err(CoreError::from)?
        .first()
        .map(|kb| kb.embed_dim)
        .unwrap_or(DEFAULT_EMBED_DIM);

    let mut vectors = VectorStore::new(vector_config(data_dir, embed_dim));
    vectors.init().await?;

    Ok(CoreState::new(
        db,
        vectors,
        EmbeddingRegistry::new(),
        ProviderRegistry::new(),
        AuditLog::new(data_dir.clone()),
    ))
}

fn print_help() {
    println!(
        r#"lexrag-cli - trusted legal RAG core admin tool

USAGE:
    lexrag-cli <command> [options]

COMMANDS:
    init                          Initialize the data directory
    kb create --name <name>       Create a knowledge base
              [--embed-dim <n>]
    kb list                       List knowledge bases
    ingest --kb <id> --file <p>   Ingest a source file
           [--force] [--dry-run]
    search --kb <id> --query <q>  Keyword search over nodes
           [--limit <n>]
    chat --kb <id> --query <q>    Run one chat turn
         [--debug]
    records <kind> <id>           Show a record (retrieval, generation,
                                  evaluation, node)
    records page <doc_id> <n>     Evidence preview of one page
    diagnose keyword-recall       Compare FTS recall to substring ground truth
             --kb <id> --keyword <k> [--top-k <n>]

OPTIONS:
    --data-dir <dir>              Data directory (default: {})
"#,
        DEFAULT_DATA_DIR
    );
}
