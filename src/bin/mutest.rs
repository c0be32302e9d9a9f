use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mutant_testing::orchestrator::{
    AssemblyImage, AssemblyVerifier, CommandVerifier, DirectoryProvisioner, Mutant,
    MutantResultState, MutantTestOrchestrator, MutationSession, NoopVerifier, ProcessBackend,
    SessionConfig, TestBackend,
};

#[derive(Debug, Parser)]
#[command(name = "mutest")]
#[command(about = "Run a test suite against mutants and classify them")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Test every mutant listed in a session file.
    Run {
        /// Session file (JSON).
        #[arg(long)]
        session: PathBuf,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// List the tests the session's runner discovers in the given assemblies.
    Discover {
        /// Session file (JSON).
        #[arg(long)]
        session: PathBuf,
        /// Assemblies to inspect.
        #[arg(required = true)]
        assemblies: Vec<PathBuf>,
    },
}

fn state_to_string(state: MutantResultState) -> &'static str {
    match state {
        MutantResultState::Untested => "untested",
        MutantResultState::Tested => "tested",
        MutantResultState::Live => "live",
        MutantResultState::Killed => "killed",
        MutantResultState::Error => "error",
    }
}

fn build_orchestrator(config: &SessionConfig) -> MutantTestOrchestrator {
    let backend: Arc<dyn TestBackend> =
        Arc::new(ProcessBackend::new("process", config.backend.clone()));
    let verifier: Arc<dyn AssemblyVerifier> = match &config.verifier {
        Some(command) => Arc::new(CommandVerifier::new(command.clone())),
        None => Arc::new(NoopVerifier),
    };
    MutantTestOrchestrator::new(
        vec![backend],
        Arc::new(DirectoryProvisioner::new(&config.work_root)),
        verifier,
    )
}

fn load_mutants(config: &SessionConfig) -> Result<Vec<Mutant>> {
    config
        .mutants
        .iter()
        .map(|entry| {
            let assemblies = entry
                .assemblies
                .iter()
                .map(|path| {
                    let bytes = fs::read(path)
                        .with_context(|| format!("reading assembly {}", path.display()))?;
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .with_context(|| format!("assembly path {} has no file name", path.display()))?;
                    Ok(AssemblyImage { file_name, bytes })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Mutant::new(entry.id.clone(), assemblies).with_description(entry.description.clone()))
        })
        .collect()
}

fn mutant_payload(mutant: &Mutant) -> serde_json::Value {
    serde_json::json!({
        "mutant_id": mutant.id,
        "description": mutant.description,
        "state": state_to_string(mutant.state),
        "killed_substate": (mutant.state == MutantResultState::Killed).then_some(mutant.killed_substate),
        "failed_tests": mutant.number_of_failed_tests,
        "load_time_ms": mutant.test_session.load_time_ms,
        "testing_time_ms": mutant.test_session.testing_time_ms,
        "load_failures": mutant
            .test_session
            .load_failures
            .iter()
            .map(|f| serde_json::json!({
                "assembly": f.assembly.display().to_string(),
                "backend": f.backend,
                "message": f.message,
            }))
            .collect::<Vec<_>>(),
        "error": mutant.test_session.error.as_ref().map(|e| serde_json::json!({
            "description": e.description,
            "message": e.message,
        })),
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { session, json } => {
            let config = SessionConfig::load(&session)
                .with_context(|| format!("loading session {}", session.display()))?;
            let mut mutants = load_mutants(&config)?;
            let orchestrator = Arc::new(build_orchestrator(&config));

            let handler_target = Arc::clone(&orchestrator);
            ctrlc::set_handler(move || handler_target.cancel_all_testing())
                .context("installing interrupt handler")?;

            let session = MutationSession::new(config.name.clone(), config.options.clone());
            orchestrator.run_session(&session, &mut mutants).await?;

            if json {
                let payload: Vec<_> = mutants.iter().map(mutant_payload).collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for mutant in &mutants {
                    let substate = match mutant.state {
                        MutantResultState::Killed => format!("{:?}", mutant.killed_substate),
                        _ => String::from("-"),
                    };
                    println!(
                        "{}\t{}\t{}\t{}ms",
                        mutant.id,
                        state_to_string(mutant.state),
                        substate,
                        mutant.test_session.testing_time_ms
                    );
                }
                let count = |state: MutantResultState| mutants.iter().filter(|m| m.state == state).count();
                println!(
                    "summary: live={}, killed={}, error={}",
                    count(MutantResultState::Live),
                    count(MutantResultState::Killed),
                    count(MutantResultState::Error)
                );
            }
        }
        Command::Discover {
            session,
            assemblies,
        } => {
            let config = SessionConfig::load(&session)
                .with_context(|| format!("loading session {}", session.display()))?;
            let orchestrator = build_orchestrator(&config);
            let loaded = orchestrator.discover_tests(&assemblies).await;
            for failure in &loaded.failures {
                eprintln!("failed to load {}: {}", failure.assembly.display(), failure.message);
            }
            for test in loaded.tree.included_tests() {
                println!("{test}");
            }
        }
    }

    Ok(())
}
