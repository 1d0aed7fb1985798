//! ResearchFlow CLI - command-line interface for research data requests.
//!
//! Reuses the same core domain logic (researchflow-core) and server
//! bootstrap (researchflow-server) as the HTTP API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use researchflow_cli::commands::{self, print_json};
use researchflow_core::{AppConfig, AppState};

/// ResearchFlow CLI - Clinical research data request automation
#[derive(Parser)]
#[command(
    name = "researchflow",
    version,
    about = "ResearchFlow CLI - Clinical research data request automation"
)]
pub struct Cli {
    /// Application database URL (`sqlite://path`, `sqlite::memory:` or a file path)
    #[arg(long, env = "DATABASE_URL")]
    db: Option<String>,

    /// Optional YAML config file layered under the environment
    #[arg(long, env = "RESEARCHFLOW_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ResearchFlow HTTP backend server
    Server {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3210)]
        port: u16,
    },

    /// Submit and drive research requests
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },

    /// Answer approval gates
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Review escalations
    Escalation {
        #[command(subcommand)]
        action: EscalationAction,
    },

    /// Manage and run ViewDefinitions
    View {
        #[command(subcommand)]
        action: ViewAction,
    },

    /// Run a read-only SELECT against the warehouse
    Sql {
        /// The query to run
        query: String,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// Submit a new request
    Submit {
        /// Researcher name
        #[arg(long)]
        name: String,
        /// Researcher email
        #[arg(long)]
        email: String,
        /// Department
        #[arg(long)]
        department: Option<String>,
        /// Free-text request
        #[arg(long)]
        text: String,
        /// Structured requirements as a JSON object
        #[arg(long)]
        requirements: Option<String>,
        /// Store the request without starting the workflow
        #[arg(long)]
        no_start: bool,
    },
    /// Run the task the request's current state calls for
    Process {
        /// Request ID
        id: String,
    },
    /// Show a request with its full history
    Show {
        /// Request ID
        id: String,
    },
    /// List requests
    List {
        /// Filter by workflow state (e.g. requirements_review)
        #[arg(long)]
        state: Option<String>,
    },
    /// Answer the requirements agent's questions
    Respond {
        /// Request ID
        id: String,
        /// Reply text
        #[arg(long, default_value = "")]
        message: String,
        /// Requirement fields to merge, as a JSON object
        #[arg(long)]
        requirements: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List approvals (pending by default)
    List {
        /// Status filter: pending, approved, modified, rejected, timeout or all
        #[arg(long)]
        status: Option<String>,
        /// Only approvals for this request
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Approve, modify or reject an approval
    Respond {
        /// Approval ID
        id: String,
        /// approve | modify | reject
        #[arg(long)]
        decision: String,
        /// Reviewer identity
        #[arg(long, env = "RESEARCHFLOW_REVIEWER")]
        reviewer: String,
        /// Review notes
        #[arg(long)]
        notes: Option<String>,
        /// Modifications as a JSON object (with modify)
        #[arg(long)]
        modifications: Option<String>,
    },
    /// Time out overdue approvals and escalate them
    CheckTimeouts,
}

#[derive(Subcommand)]
enum EscalationAction {
    /// List escalations (pending_review by default)
    List {
        /// Status filter: pending_review, resolved, dismissed or all
        #[arg(long)]
        status: Option<String>,
        /// Only escalations for this request
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Close an escalation
    Resolve {
        /// Escalation ID
        id: String,
        /// retry | resolve | dismiss | abort
        #[arg(long)]
        action: String,
        /// Resolution notes
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum ViewAction {
    /// Validate a ViewDefinition file (JSON or YAML)
    Validate {
        /// Path to the definition
        file: PathBuf,
    },
    /// Save a ViewDefinition file into the view directory
    Save {
        /// Path to the definition
        file: PathBuf,
    },
    /// List saved views
    List,
    /// Run a saved view
    Run {
        /// View name
        name: String,
        /// FHIR search parameter as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
        /// Maximum rows to print
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "researchflow_core=warn,researchflow_server=info,researchflow_cli=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = cli.command else {
        // No subcommand - show help
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let result = match commands::load_config(cli.config.as_deref(), cli.db.as_deref()) {
        Ok(config) => run(command, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<(), String> {
    let output = match command {
        Commands::Server { host, port } => return commands::server::run(host, port, config).await,
        Commands::View {
            action: ViewAction::Validate { file },
        } => commands::view::validate(&file)?,
        Commands::Request { action } => {
            let state = commands::init_state(config).await?;
            run_request(&state, action).await?
        }
        Commands::Approval { action } => {
            let state = commands::init_state(config).await?;
            run_approval(&state, action).await?
        }
        Commands::Escalation { action } => {
            let state = commands::init_state(config).await?;
            match action {
                EscalationAction::List { status, request_id } => {
                    commands::escalation::list(&state, status.as_deref(), request_id.as_deref())
                        .await?
                }
                EscalationAction::Resolve { id, action, notes } => {
                    commands::escalation::resolve(&state, &id, &action, notes).await?
                }
            }
        }
        Commands::View { action } => {
            let state = commands::init_state(config).await?;
            run_view(&state, action).await?
        }
        Commands::Sql { query } => {
            let state = commands::init_state(config).await?;
            commands::sql::execute(&state, &query).await?
        }
    };

    print_json(&output);
    Ok(())
}

fn json_arg(flag: &str, raw: Option<String>) -> Result<Option<Value>, String> {
    raw.map(|r| commands::parse_json_arg(flag, &r)).transpose()
}

async fn run_request(state: &AppState, action: RequestAction) -> Result<Value, String> {
    match action {
        RequestAction::Submit {
            name,
            email,
            department,
            text,
            requirements,
            no_start,
        } => {
            let args = commands::request::SubmitArgs {
                researcher_name: name,
                researcher_email: email,
                department,
                text,
                requirements: json_arg("--requirements", requirements)?,
                auto_start: !no_start,
            };
            commands::request::submit(state, args).await
        }
        RequestAction::Process { id } => commands::request::process(state, &id).await,
        RequestAction::Show { id } => commands::request::show(state, &id).await,
        RequestAction::List { state: filter } => {
            commands::request::list(state, filter.as_deref()).await
        }
        RequestAction::Respond {
            id,
            message,
            requirements,
        } => {
            let requirements = json_arg("--requirements", requirements)?;
            commands::request::respond(state, &id, &message, requirements).await
        }
    }
}

async fn run_approval(state: &AppState, action: ApprovalAction) -> Result<Value, String> {
    match action {
        ApprovalAction::List { status, request_id } => {
            commands::approval::list(state, status.as_deref(), request_id.as_deref()).await
        }
        ApprovalAction::Respond {
            id,
            decision,
            reviewer,
            notes,
            modifications,
        } => {
            let modifications = json_arg("--modifications", modifications)?;
            commands::approval::respond(state, &id, &decision, &reviewer, notes, modifications)
                .await
        }
        ApprovalAction::CheckTimeouts => commands::approval::check_timeouts(state).await,
    }
}

async fn run_view(state: &AppState, action: ViewAction) -> Result<Value, String> {
    match action {
        ViewAction::Validate { file } => commands::view::validate(&file),
        ViewAction::Save { file } => commands::view::save(state, &file),
        ViewAction::List => commands::view::list(state),
        ViewAction::Run {
            name,
            params,
            limit,
        } => {
            let params = commands::view::parse_params(&params)?;
            commands::view::run(state, &name, &params, limit).await
        }
    }
}
