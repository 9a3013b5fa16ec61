//! Notebook scenarios replayed by the CLI
//!
//! Each scenario builds a notebook, drives it the way a user would (running
//! paragraphs, clicking rendered elements) and checks what the renderer and
//! the paragraph outputs show after every step.

use crate::render::TemplateRenderer;
use crate::runtime::{paragraph_fn, Notebook};
use nbx_core::{
    watch_fn, AngularValue, Binder, BinderConfig, ExecutionContext, Scope, TriggerBridge,
    UnitStatus,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// One user-visible step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioStep {
    /// What the user did
    pub action: String,
    /// Rendered template after the step
    pub rendered: String,
    /// Paragraph output inspected after the step, if any
    pub output: Option<String>,
}

/// Result of a scenario replay
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Steps in order
    pub steps: Vec<ScenarioStep>,
    /// Mismatches between expected and observed state
    pub failures: Vec<String>,
}

impl ScenarioReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn step(&mut self, action: &str, rendered: String, output: Option<String>) {
        self.steps.push(ScenarioStep {
            action: action.to_string(),
            rendered,
            output,
        });
    }

    fn expect<T: PartialEq + std::fmt::Debug>(&mut self, what: &str, actual: T, expected: T) {
        if actual != expected {
            warn!(scenario = %self.name, what, ?actual, ?expected, "scenario check failed");
            self.failures
                .push(format!("{what}: expected {expected:?}, got {actual:?}"));
        }
    }

    /// Check if every expectation held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut text = format!("Scenario: {}\n", self.name);
        for (i, step) in self.steps.iter().enumerate() {
            text.push_str(&format!("  {:>2}. {:<28} | {}", i + 1, step.action, step.rendered));
            if let Some(output) = &step.output {
                text.push_str(&format!(" | output: {}", output.trim_end()));
            }
            text.push('\n');
        }
        for failure in &self.failures {
            text.push_str(&format!("  FAILED: {failure}\n"));
        }
        text.push_str(&format!(
            "  Status: {}\n",
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        text
    }
}

const DISPLAY_TEMPLATE: &str = "BindingTest_{{myVar}}_";

/// Bind, click, watch, click, unbind and rebind a value shown in a template
///
/// # Errors
/// Fails if the binder rejects a UI update or a value cannot be decoded.
pub async fn display(config: BinderConfig) -> anyhow::Result<ScenarioReport> {
    let notebook = Notebook::standalone(config, "angular-display");
    let binder = Arc::clone(notebook.binder());
    let mut report = ScenarioReport::new("angular display");

    notebook.add_paragraph(
        "bind",
        paragraph_fn(|z| async move {
            z.angular_bind("myVar", &1).await?;
            anyhow::Ok(())
        }),
    );
    notebook.add_paragraph(
        "print",
        paragraph_fn(|z| async move {
            let value = z.angular("myVar").map(|v| v.render()).unwrap_or_default();
            z.print(format!("myVar={value}"));
            anyhow::Ok(())
        }),
    );
    notebook.add_paragraph(
        "watch",
        paragraph_fn(|z| async move {
            let runner = z.clone();
            z.angular_watch(
                "myVar",
                watch_fn(move |_before, _after, ctx| {
                    let runner = runner.clone();
                    async move {
                        runner.run_with("print", &ctx).await?;
                        anyhow::Ok(())
                    }
                }),
            )?;
            anyhow::Ok(())
        }),
    );
    notebook.add_paragraph(
        "unbind",
        paragraph_fn(|z| async move {
            z.angular_unbind("myVar")?;
            anyhow::Ok(())
        }),
    );

    let mut renderer = TemplateRenderer::connect(&binder, notebook.scope(), DISPLAY_TEMPLATE);
    report.step("open note", renderer.render(), None);
    report.expect("initial render", renderer.render().as_str(), "BindingTest__");

    notebook.run("bind").await;
    renderer.pump(&binder)?;
    report.step("run bind paragraph", renderer.render(), None);
    report.expect("render after bind", renderer.render().as_str(), "BindingTest_1_");

    notebook.run("print").await;
    let output = notebook.output("print");
    report.step("run print paragraph", renderer.render(), output.clone());
    report.expect("print after bind", output.as_deref(), Some("myVar=1"));

    click_increment(&binder, &mut renderer).await?;
    report.step("click (myVar+1)", renderer.render(), None);
    report.expect("render after click", renderer.render().as_str(), "BindingTest_2_");

    notebook.run("watch").await;
    report.step("run watch paragraph", renderer.render(), None);

    click_increment(&binder, &mut renderer).await?;
    let output = notebook.output("print");
    report.step("click (myVar+1)", renderer.render(), output.clone());
    report.expect("render after watched click", renderer.render().as_str(), "BindingTest_3_");
    report.expect("print run by watcher", output.as_deref(), Some("myVar=3"));
    report.expect(
        "print runs",
        notebook.result("print").map(|r| r.runs),
        Some(2),
    );

    notebook.run("unbind").await;
    renderer.pump(&binder)?;
    report.step("run unbind paragraph", renderer.render(), None);
    report.expect("render after unbind", renderer.render().as_str(), "BindingTest__");

    notebook.run("bind").await;
    renderer.pump(&binder)?;
    report.step("run bind paragraph", renderer.render(), None);
    report.expect("render after rebind", renderer.render().as_str(), "BindingTest_1_");
    report.expect(
        "watcher dropped by unbind",
        notebook.result("print").map(|r| r.runs),
        Some(2),
    );

    notebook.close();
    info!(passed = report.passed(), "display scenario finished");
    Ok(report)
}

async fn click_increment(binder: &Binder, renderer: &mut TemplateRenderer) -> anyhow::Result<()> {
    let current: i64 = renderer
        .value("myVar")
        .map(AngularValue::decode)
        .transpose()?
        .unwrap_or(0);
    renderer.update(binder, "myVar", &(current + 1)).await?;
    renderer.pump(binder)?;
    Ok(())
}

/// Run a paragraph from a rendered button and from another paragraph
///
/// # Errors
/// Fails if the renderer stream closes early.
pub async fn run_paragraph(config: BinderConfig) -> anyhow::Result<ScenarioReport> {
    let notebook = Notebook::standalone(config, "angular-run-paragraph");
    let binder = Arc::clone(notebook.binder());
    let mut report = ScenarioReport::new("angular run paragraph");

    notebook.add_paragraph(
        "hello",
        paragraph_fn(|z| async move {
            z.print("Hello world");
            anyhow::Ok(())
        }),
    );
    notebook.add_paragraph(
        "chain",
        paragraph_fn(|z| async move {
            let status = z.run("hello").await?;
            z.print(format!("hello finished with {status:?}"));
            anyhow::Ok(())
        }),
    );

    let renderer = TemplateRenderer::connect(
        &binder,
        notebook.paragraph_scope("button"),
        "<button ng-click=\"z.runParagraph('hello')\">run</button>",
    );

    let status = renderer.click_run(&binder, "hello").await;
    let output = notebook.output("hello");
    report.step("click run button", renderer.render(), output.clone());
    report.expect("button run status", status, UnitStatus::Finished);
    report.expect("button run output", output.as_deref(), Some("Hello world"));

    let status = notebook.run("chain").await;
    let output = notebook.output("chain");
    report.step("run chain paragraph", renderer.render(), output.clone());
    report.expect("chain status", status, UnitStatus::Finished);
    report.expect("chain output", output.as_deref(), Some("hello finished with Finished"));
    report.expect("hello runs", notebook.result("hello").map(|r| r.runs), Some(2));

    let status = renderer.click_run(&binder, "missing").await;
    report.step("click unknown paragraph", renderer.render(), None);
    report.expect("unknown paragraph status", status, UnitStatus::Error);

    notebook.close();
    info!(passed = report.passed(), "run-paragraph scenario finished");
    Ok(report)
}

/// Result of a concurrent bind stress run
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    /// Keys bound concurrently
    pub keys: usize,
    /// Binds per key
    pub iterations: usize,
    /// Total binds performed
    pub binds: usize,
    /// Wall time
    pub elapsed_ms: u128,
    /// Version or delivery anomalies
    pub violations: usize,
    /// No anomalies and no failed binds
    pub success: bool,
}

/// Bind `keys` keys `iterations` times each from concurrent tasks
///
/// Every key has one watcher; each task checks that its versions come out
/// as 1, 2, 3, ... and the watcher fired once per bind.
///
/// # Errors
/// Fails if a bind task panics.
pub async fn stress(config: BinderConfig, keys: usize, iterations: usize) -> anyhow::Result<StressReport> {
    let binder = Arc::new(Binder::new(config.clone(), Arc::new(TriggerBridge::new(&config))));
    let scope = Scope::note("stress");
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for index in 0..keys {
        let key = format!("key-{index}");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        binder.watch(
            &scope,
            &key,
            watch_fn(move |_, _, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { anyhow::Ok(()) }
            }),
        );

        let binder = Arc::clone(&binder);
        let scope = scope.clone();
        tasks.spawn(async move {
            let ctx = ExecutionContext::new("stress");
            let mut violations = 0;
            for i in 0..iterations {
                match binder.bind(&scope, &key, &i, &ctx).await {
                    Ok(outcome) if outcome.version == i as u64 + 1 => {}
                    Ok(_) | Err(_) => violations += 1,
                }
            }
            if fired.load(Ordering::Relaxed) != iterations {
                violations += 1;
            }
            violations
        });
    }

    let mut violations = 0;
    while let Some(joined) = tasks.join_next().await {
        violations += joined?;
    }

    let report = StressReport {
        keys,
        iterations,
        binds: keys * iterations,
        elapsed_ms: started.elapsed().as_millis(),
        violations,
        success: violations == 0,
    };
    info!(?report, "stress run finished");
    Ok(report)
}
