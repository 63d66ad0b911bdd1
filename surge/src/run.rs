use anyhow::Context as _;
use std::sync::Arc;

use surge_core::config::DEFAULT_DURATION;
use surge_core::pool::ProcessCommand;
use surge_core::{
    Controller, ControllerConfig, ExecutionMode, Reporter, RequestOptions, SeriesWriter,
    TargetSpec, WeightedTargetPool, WorkerPool, WorkerSpec, default_max_workers,
};
use surge_http::HttpClient;

use crate::cli::RunArgs;
use crate::exit_codes::ExitCode;
use crate::run_error::RunError;
use crate::scenario::{self, ScenarioYaml};

/// Everything a run needs, with CLI flags applied over the scenario file.
#[derive(Debug)]
pub(crate) struct RunPlan {
    pub targets: Vec<TargetSpec>,
    pub pool: Arc<WeightedTargetPool>,
    pub request: RequestOptions,
    pub controller: ControllerConfig,
    pub mode: ExecutionMode,
}

impl RunPlan {
    pub(crate) fn resolve(scenario: ScenarioYaml, args: &RunArgs) -> Result<Self, RunError> {
        let invalid = |err: surge_core::Error| RunError::from_core(err, "invalid scenario");

        let base_url = args
            .base_url
            .clone()
            .or_else(|| scenario.base_url.clone())
            .ok_or_else(|| {
                RunError::InvalidInput(anyhow::anyhow!(
                    "no base URL: set `baseUrl` in the scenario or pass --base-url"
                ))
            })?;

        let mode = match (args.mode, scenario.mode.as_deref()) {
            (Some(mode), _) => mode,
            (None, Some(raw)) => ExecutionMode::parse(raw).map_err(invalid)?,
            (None, None) => ExecutionMode::default(),
        };

        let request = RequestOptions {
            base_url,
            headers: merge_headers(&scenario, &args.headers),
            test_id: args.test_id.clone().or_else(|| scenario.test_id.clone()),
            timeout: (!args.request_timeout.is_zero()).then_some(args.request_timeout),
        };
        request.validate().map_err(invalid)?;

        let pool = Arc::new(WeightedTargetPool::from_specs(&scenario.targets).map_err(invalid)?);

        let controller = ControllerConfig {
            duration: args
                .duration
                .or_else(|| scenario.duration())
                .unwrap_or(DEFAULT_DURATION),
            max_workers: args
                .workers
                .or(scenario.workers)
                .unwrap_or_else(default_max_workers),
            flush_timeout: args.flush_timeout,
            ..ControllerConfig::default()
        };
        controller.validate().map_err(invalid)?;

        Ok(Self {
            targets: scenario.targets,
            pool,
            request,
            controller,
            mode,
        })
    }
}

/// Scenario headers first, then CLI headers; a CLI header replaces any scenario header
/// with the same (case-insensitive) name.
fn merge_headers(scenario: &ScenarioYaml, cli: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = scenario
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (name, value) in cli {
        out.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        out.push((name.clone(), value.clone()));
    }
    out
}

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let scenario = scenario::load(&args.scenario)
        .await
        .map_err(RunError::InvalidInput)?;
    let plan = RunPlan::resolve(scenario, &args)?;

    if let Some(parent) = args.results.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create results dir: {}", parent.display()))
            .map_err(RunError::RuntimeError)?;
    }
    let series = SeriesWriter::create(&args.results).map_err(|err| {
        RunError::from_core(
            err,
            &format!("failed to open results file: {}", args.results.display()),
        )
    })?;

    let reporter = Reporter::new(args.output.into(), std::io::stdout(), series);
    let controller = Controller::new(plan.controller.clone(), reporter)
        .map_err(|err| RunError::from_core(err, "invalid run configuration"))?;

    let workers = plan.controller.max_workers;
    tracing::info!(
        mode = %plan.mode,
        workers,
        targets = plan.targets.len(),
        base_url = %plan.request.base_url,
        "starting run"
    );

    let pool = match plan.mode {
        ExecutionMode::Threaded => WorkerPool::threaded(
            workers,
            plan.pool.clone(),
            Arc::new(plan.request.clone()),
            HttpClient::default,
        ),
        ExecutionMode::MultiProcess => {
            let command = ProcessCommand::current_exe(["worker"])
                .map_err(|err| RunError::from_core(err, "failed to locate the surge executable"))?;
            let spec = WorkerSpec {
                targets: plan.targets.clone(),
                request: plan.request.clone(),
            };
            WorkerPool::spawn_processes(workers, &command, &spec)
                .await
                .map_err(|err| RunError::from_core(err, "failed to start worker processes"))?
        }
    };

    controller
        .run(pool)
        .await
        .map_err(|err| RunError::from_core(err, "run failed"))?;

    Ok(ExitCode::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser as _;
    use std::time::Duration;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["surge", "run", "scenario.yaml"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv) {
            Ok(Cli {
                command: Command::Run(args),
            }) => args,
            Ok(_) => panic!("expected run command"),
            Err(err) => panic!("failed to parse args: {err}"),
        }
    }

    fn scenario(text: &str) -> ScenarioYaml {
        match scenario::parse(text) {
            Ok(s) => s,
            Err(err) => panic!("failed to parse scenario: {err:#}"),
        }
    }

    fn resolve(text: &str, extra: &[&str]) -> Result<RunPlan, RunError> {
        RunPlan::resolve(scenario(text), &args(extra))
    }

    const BASIC: &str = r#"
baseUrl: http://yaml:1
testId: from-yaml
duration: 5s
mode: threaded
workers: 3
headers:
  Authorization: Bearer yaml
  x-keep: "1"
targets:
  - path: /a
    weight: 2
"#;

    #[test]
    fn scenario_values_apply_without_flags() {
        let plan = match resolve(BASIC, &[]) {
            Ok(p) => p,
            Err(err) => panic!("{err}"),
        };
        assert_eq!(plan.request.base_url, "http://yaml:1");
        assert_eq!(plan.request.test_id.as_deref(), Some("from-yaml"));
        assert_eq!(plan.request.timeout, Some(Duration::from_secs(30)));
        assert_eq!(plan.controller.duration, Duration::from_secs(5));
        assert_eq!(plan.controller.max_workers, 3);
        assert_eq!(plan.mode, ExecutionMode::Threaded);
        assert_eq!(plan.pool.len(), 2);
    }

    #[test]
    fn cli_flags_override_scenario() {
        let plan = match resolve(
            BASIC,
            &[
                "--base-url",
                "http://cli:2",
                "--test-id",
                "from-cli",
                "--duration",
                "250ms",
                "--mode",
                "multi-process",
                "--workers",
                "7",
                "--header",
                "authorization: Bearer cli",
                "--request-timeout",
                "0s",
            ],
        ) {
            Ok(p) => p,
            Err(err) => panic!("{err}"),
        };
        assert_eq!(plan.request.base_url, "http://cli:2");
        assert_eq!(plan.request.test_id.as_deref(), Some("from-cli"));
        assert_eq!(plan.request.timeout, None);
        assert_eq!(plan.controller.duration, Duration::from_millis(250));
        assert_eq!(plan.controller.max_workers, 7);
        assert_eq!(plan.mode, ExecutionMode::MultiProcess);
        assert_eq!(
            plan.request.headers,
            vec![
                ("x-keep".to_string(), "1".to_string()),
                ("authorization".to_string(), "Bearer cli".to_string()),
            ]
        );
    }

    #[test]
    fn duration_defaults_to_ten_seconds() {
        let plan = match resolve("targets: [{path: /a, weight: 1}]", &["--base-url", "http://x"]) {
            Ok(p) => p,
            Err(err) => panic!("{err}"),
        };
        assert_eq!(plan.controller.duration, Duration::from_secs(10));
        assert_eq!(plan.controller.max_workers, default_max_workers());
    }

    #[test]
    fn configuration_problems_are_invalid_input() {
        let cases = [
            ("targets: [{path: /a, weight: 1}]", vec![]),
            ("baseUrl: http://x", vec![]),
            ("baseUrl: http://x\ntargets: [{path: /a, weight: 0}]", vec![]),
            ("baseUrl: ftp://x\ntargets: [{path: /a, weight: 1}]", vec![]),
            (
                "baseUrl: http://x\nmode: fibers\ntargets: [{path: /a, weight: 1}]",
                vec![],
            ),
            (
                "baseUrl: http://x\nworkers: 0\ntargets: [{path: /a, weight: 1}]",
                vec![],
            ),
        ];
        for (text, extra) in cases {
            match resolve(text, &extra) {
                Ok(_) => panic!("expected failure for {text:?}"),
                Err(err) => assert_eq!(err.exit_code(), ExitCode::InvalidInput, "{text:?}: {err}"),
            }
        }
    }
}
