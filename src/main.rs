use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use suitecheck::config::{Cli, Commands, OutputFormat, ProbeArgs, RunArgs, SuiteFile};
use suitecheck::junit::JunitReporter;
use suitecheck::logging::init_logging;
use suitecheck::precondition::ensure_artifact;
use suitecheck::probe::Probe;
use suitecheck::reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use suitecheck::scheduler::Scheduler;
use suitecheck::signals::install_signal_handlers;
use suitecheck::supervisor::ProcessExecutor;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut reporter = build_reporter(&cli);

    match dispatch(&cli, reporter.as_mut()) {
        Ok(code) => code,
        Err(e) => {
            reporter.on_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn build_reporter(cli: &Cli) -> Box<dyn Reporter> {
    let mut reporters: Vec<Box<dyn Reporter>> = vec![match cli.format {
        OutputFormat::Human => Box::new(HumanReporter),
        OutputFormat::Json => Box::new(JsonReporter),
    }];
    if let Some(path) = &cli.junit_xml {
        reporters.push(Box::new(JunitReporter::new(path.clone())));
    }
    Box::new(MultiReporter::new(reporters))
}

fn dispatch(cli: &Cli, reporter: &mut dyn Reporter) -> Result<ExitCode> {
    match &cli.command {
        None => run_suite(cli, &RunArgs::default(), reporter),
        Some(Commands::Run(args)) => run_suite(cli, args, reporter),
        Some(Commands::Probe(args)) => run_probe(cli, args, reporter),
        Some(Commands::List) => list_tasks(cli),
    }
}

fn run_suite(cli: &Cli, args: &RunArgs, reporter: &mut dyn Reporter) -> Result<ExitCode> {
    let suite = SuiteFile::load(&cli.suite)?;
    let shutdown = install_signal_handlers().context("failed to install signal handlers")?;

    // Precondition: once, before any task
    if !args.skip_build {
        if let Some(build) = &suite.build {
            ensure_artifact(build)?;
        }
    }

    let mut scheduler =
        Scheduler::new(ProcessExecutor::new(shutdown.clone())).with_shutdown(shutdown);
    let summary = scheduler.run(&suite.tasks, reporter);

    Ok(ExitCode::from(summary.exit_code() as u8))
}

fn run_probe(cli: &Cli, args: &ProbeArgs, reporter: &mut dyn Reporter) -> Result<ExitCode> {
    // The suite file is optional when --server is given
    let from_file = if cli.suite.exists() {
        SuiteFile::load(&cli.suite)?.probe
    } else {
        None
    };
    let config = args.resolve(from_file)?;
    // A signal (Ctrl-C, or the supervisor timing out a probe task) must
    // still tear the server down
    let shutdown = install_signal_handlers().context("failed to install signal handlers")?;

    let mut probe = Probe::new(config).with_shutdown(shutdown);
    let outcome = probe.run();
    reporter.on_probe_finished(&outcome);

    Ok(if outcome.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_tasks(cli: &Cli) -> Result<ExitCode> {
    let suite = SuiteFile::load(&cli.suite)?;
    for (index, task) in suite.tasks.iter().enumerate() {
        let marker = if task.critical { " [critical]" } else { "" };
        println!(
            "{:>2}. {}{} ({}s): {}",
            index + 1,
            task.name,
            marker,
            task.timeout,
            task.command_line()
        );
    }
    if let Some(build) = &suite.build {
        println!("build: {} -> {}", build.command.join(" "), build.artifact.display());
    }
    Ok(ExitCode::SUCCESS)
}
