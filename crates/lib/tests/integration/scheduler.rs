//! Dispatch, failure handling and reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use minicons_lib::state::{LockMode, StateLock};
use minicons_lib::{
  BlockCause, BuildContext, BuildOutcome, Builder, ConfigError, ExecuteConfig, ExecuteError, FnBuilder, TargetStatus,
};

use super::common::{Counter, Tree, block_on, build, concat, failing};

#[test]
fn cycles_are_rejected_before_anything_runs() {
  let tree = Tree::new();
  let counter = Counter::default();
  let mut env = tree.env();
  let a = env.file("a").unwrap();
  let b = env.file("b").unwrap();
  let c = env.file("c").unwrap();
  env.register_builder(concat("a", &counter), &[a], &[b]).unwrap();
  env.register_builder(concat("b", &counter), &[b], &[c]).unwrap();
  env.register_builder(concat("c", &counter), &[c], &[a]).unwrap();

  let err = block_on(env.request_build(&["a"])).unwrap_err();
  match &err {
    ExecuteError::CycleDetected { path } => assert_eq!(path, &["a", "b", "c", "a"]),
    other => panic!("expected a cycle, got {other:?}"),
  }
  assert_eq!(err.exit_code(), 2);
  assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> c -> a");
  assert_eq!(counter.get(), 0);
}

#[test]
fn conflicting_producers_fail_at_registration() {
  let tree = Tree::new();
  let counter = Counter::default();
  let mut env = tree.env();
  let out = env.file("out.o").unwrap();
  env.register_builder(concat("first", &counter), &[out], &[]).unwrap();
  let err = env.register_builder(concat("second", &counter), &[out], &[]).unwrap_err();
  assert!(matches!(err, ConfigError::DuplicateProducer { .. }));
  assert_eq!(counter.get(), 0);
}

#[test]
fn unknown_names_are_configuration_errors() {
  let tree = Tree::new();
  let mut env = tree.env();
  let err = block_on(env.request_build(&["nothing-here"])).unwrap_err();
  assert!(matches!(err, ExecuteError::Config(ConfigError::UnknownTarget(_))));
  assert_eq!(err.exit_code(), 2);
}

/// Two independent chains: `bad -> after_bad` and `good`.
fn two_chains(tree: &Tree, counter: &Counter) -> minicons_lib::Environment {
  tree.write("src.txt", "s");
  let mut env = tree.env();
  let src = env.file("src.txt").unwrap();
  let bad = env.file("bad.txt").unwrap();
  let after_bad = env.file("after_bad.txt").unwrap();
  let good = env.file("good.txt").unwrap();
  env.register_builder(failing("bad", counter), &[bad], &[src]).unwrap();
  env.register_builder(concat("after_bad", counter), &[after_bad], &[bad]).unwrap();
  env.register_builder(concat("good", counter), &[good], &[src]).unwrap();
  env.register_alias("all", &[after_bad, good]).unwrap();
  env
}

#[test]
fn failure_stops_dispatch_without_keep_going() {
  let tree = Tree::new();
  let counter = Counter::default();
  let mut env = two_chains(&tree, &counter);
  let config = ExecuteConfig::default().with_parallelism(1).with_keep_going(false);

  let report = block_on(env.request_build_with(&["all"], &config)).unwrap();
  assert!(matches!(report.status("bad.txt"), Some(TargetStatus::Failed { error }) if error == "compiler exploded"));
  assert_eq!(
    report.status("after_bad.txt"),
    Some(&TargetStatus::Blocked {
      cause: BlockCause::FailedDependency {
        node: "bad.txt".to_string()
      }
    })
  );
  assert_eq!(report.status("good.txt"), Some(&TargetStatus::Cancelled));
  assert!(matches!(report.requested.get("all"), Some(TargetStatus::Blocked { .. })));
  assert_eq!(report.invocations, 1);
  assert!(!report.is_success());
}

#[test]
fn keep_going_builds_unrelated_branches() {
  let tree = Tree::new();
  let counter = Counter::default();
  let mut env = two_chains(&tree, &counter);
  let config = ExecuteConfig::default().with_parallelism(1).with_keep_going(true);

  let report = block_on(env.request_build_with(&["all", "bad.txt"], &config)).unwrap();
  assert_eq!(report.status("good.txt"), Some(&TargetStatus::Built));
  assert!(matches!(report.status("after_bad.txt"), Some(TargetStatus::Blocked { .. })));
  assert!(matches!(report.requested.get("bad.txt"), Some(TargetStatus::Failed { .. })));
  assert_eq!(report.failed(), 1);
  assert_eq!(report.blocked(), 1);
  assert_eq!(report.invocations, 2);

  // the failed builder is retried next time, the good one is not
  let report = block_on(env.request_build_with(&["all"], &config)).unwrap();
  assert_eq!(report.status("good.txt"), Some(&TargetStatus::UpToDate));
  assert_eq!(report.invocations, 1);
}

#[test]
fn multi_target_builders_run_once() {
  let tree = Tree::new();
  tree.write("api.idl", "interface");
  let counter = Counter::default();
  let mut env = tree.env();
  let idl = env.file("api.idl").unwrap();
  let header = env.file("gen/api.h").unwrap();
  let stub = env.file("gen/api.c").unwrap();
  let user_h = env.file("user_h.txt").unwrap();
  let user_c = env.file("user_c.txt").unwrap();
  env.register_builder(concat("idl", &counter), &[header, stub], &[idl]).unwrap();
  env.register_builder(concat("use_h", &counter), &[user_h], &[header]).unwrap();
  env.register_builder(concat("use_c", &counter), &[user_c], &[stub]).unwrap();

  let config = ExecuteConfig::default().with_parallelism(4);
  let report = block_on(env.request_build_with(&["user_h.txt", "user_c.txt"], &config)).unwrap();
  assert!(report.is_success(), "{report:?}");
  assert_eq!(report.invocations, 3);
  assert_eq!(counter.get(), 3);
  assert_eq!(tree.read("user_c.txt"), "interface");

  // requesting one output still brings its sibling up to date
  tree.write("api.idl", "interface v2");
  let report = build(&mut env, &["user_h.txt"]);
  assert_eq!(report.status("gen/api.c"), Some(&TargetStatus::Built));
  assert_eq!(tree.read("gen/api.c"), "interface v2");
}

#[test]
fn dry_runs_report_without_building() {
  let tree = Tree::new();
  tree.write("in.txt", "x");
  let counter = Counter::default();
  let mut env = tree.env();
  let input = env.file("in.txt").unwrap();
  let mid = env.file("mid.txt").unwrap();
  let out = env.file("out.txt").unwrap();
  env.register_builder(concat("mid", &counter), &[mid], &[input]).unwrap();
  env.register_builder(concat("out", &counter), &[out], &[mid]).unwrap();

  let dry = ExecuteConfig::default().with_dry_run(true);
  let report = block_on(env.request_build_with(&["out.txt"], &dry)).unwrap();
  assert!(report.dry_run);
  assert_eq!(report.status("mid.txt"), Some(&TargetStatus::WouldBuild));
  assert_eq!(report.status("out.txt"), Some(&TargetStatus::WouldBuild));
  assert_eq!(report.invocations, 0);
  assert!(!tree.path("out.txt").exists());
  assert!(env.store().list().unwrap().is_empty());

  build(&mut env, &["out.txt"]);
  let report = block_on(env.request_build_with(&["out.txt"], &dry)).unwrap();
  assert_eq!(report.status("out.txt"), Some(&TargetStatus::UpToDate));
  assert_eq!(counter.get(), 2);
}

#[test]
fn a_held_state_lock_refuses_the_build() {
  let tree = Tree::new();
  let counter = Counter::default();
  let mut env = tree.env();
  let out = env.file("out.txt").unwrap();
  env.register_builder(concat("out", &counter), &[out], &[]).unwrap();

  let _held = StateLock::acquire(&env.config().state_dir, LockMode::Exclusive, "test").unwrap();
  let err = block_on(env.request_build(&["out.txt"])).unwrap_err();
  assert!(matches!(err, ExecuteError::Lock(_)));
  assert_eq!(err.exit_code(), 1);
  assert_eq!(counter.get(), 0);
}

#[test]
fn builders_see_environment_variables() {
  let tree = Tree::new();
  let mut env = tree.env();
  env.set_var("GREETING", serde_json::json!("hello"));
  let out = env.file("greeting.txt").unwrap();
  env
    .register_builder(
      FnBuilder::new("greet", |ctx: &mut BuildContext| {
        let greeting = ctx.var("GREETING").and_then(|v| v.as_str()).unwrap_or("none").to_string();
        if let Some(path) = ctx.target_path() {
          std::fs::write(path, greeting)?;
        }
        Ok(BuildOutcome::Built)
      }),
      &[out],
      &[],
    )
    .unwrap();

  assert!(build(&mut env, &["greeting.txt"]).is_success());
  assert_eq!(tree.read("greeting.txt"), "hello");
}

/// Records when each builder ran and how many ran at once.
#[derive(Clone, Default)]
struct Timeline {
  in_flight: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
  spans: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

impl Timeline {
  /// A builder that holds its slot for a while, then writes its name.
  fn builder(&self, name: &str) -> impl Builder + 'static {
    let timeline = self.clone();
    let label = name.to_string();
    FnBuilder::new(name, move |ctx: &mut BuildContext| {
      let start = Instant::now();
      let running = timeline.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      timeline.peak.fetch_max(running, Ordering::SeqCst);
      std::thread::sleep(Duration::from_millis(150));
      for target in ctx.targets() {
        if let Some(path) = target.path() {
          std::fs::write(path, &label)?;
        }
      }
      timeline.in_flight.fetch_sub(1, Ordering::SeqCst);
      timeline.spans.lock().unwrap().push((label.clone(), start, Instant::now()));
      Ok(BuildOutcome::Built)
    })
  }

  fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  fn span(&self, name: &str) -> (Instant, Instant) {
    let spans = self.spans.lock().unwrap();
    let (_, start, end) = spans
      .iter()
      .find(|(label, _, _)| label == name)
      .unwrap_or_else(|| panic!("{name} never ran"));
    (*start, *end)
  }
}

fn block_on_threads<F: std::future::Future>(future: F) -> F::Output {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(2)
    .enable_all()
    .build()
    .unwrap()
    .block_on(future)
}

/// `count` independent outputs behind the alias `all`.
fn independent(tree: &Tree, timeline: &Timeline, count: usize) -> minicons_lib::Environment {
  let mut env = tree.env();
  let mut outputs = Vec::new();
  for i in 0..count {
    let out = env.file(&format!("out{i}.txt")).unwrap();
    env.register_builder(timeline.builder(&format!("job{i}")), &[out], &[]).unwrap();
    outputs.push(out);
  }
  env.register_alias("all", &outputs).unwrap();
  env
}

#[test]
fn parallelism_bounds_running_builders() {
  let tree = Tree::new();
  let timeline = Timeline::default();
  let mut env = independent(&tree, &timeline, 4);

  let config = ExecuteConfig::default().with_parallelism(2);
  let report = block_on_threads(env.request_build_with(&["all"], &config)).unwrap();
  assert!(report.is_success(), "{report:?}");
  assert_eq!(report.invocations, 4);
  assert_eq!(timeline.peak(), 2);
}

#[test]
fn independent_builders_run_side_by_side() {
  let tree = Tree::new();
  let timeline = Timeline::default();
  let mut env = independent(&tree, &timeline, 3);

  let config = ExecuteConfig::default().with_parallelism(4);
  let report = block_on_threads(env.request_build_with(&["all"], &config)).unwrap();
  assert!(report.is_success(), "{report:?}");
  assert_eq!(timeline.peak(), 3);

  let spans = ["job0", "job1", "job2"].map(|name| timeline.span(name));
  let last_start = spans.iter().map(|(start, _)| *start).max().unwrap();
  let first_end = spans.iter().map(|(_, end)| *end).min().unwrap();
  assert!(last_start < first_end, "builders ran one after another");
}

#[test]
fn dependent_builders_never_overlap() {
  let tree = Tree::new();
  let timeline = Timeline::default();
  let mut env = tree.env();
  let lib = env.file("lib.txt").unwrap();
  let app = env.file("app.txt").unwrap();
  let docs = env.file("docs.txt").unwrap();
  env.register_builder(timeline.builder("lib"), &[lib], &[]).unwrap();
  env.register_builder(timeline.builder("app"), &[app], &[lib]).unwrap();
  env.register_builder(timeline.builder("docs"), &[docs], &[]).unwrap();

  let config = ExecuteConfig::default().with_parallelism(4);
  let report = block_on_threads(env.request_build_with(&["app.txt", "docs.txt"], &config)).unwrap();
  assert!(report.is_success(), "{report:?}");

  let (_, lib_end) = timeline.span("lib");
  let (app_start, _) = timeline.span("app");
  assert!(app_start >= lib_end, "app started before lib finished");
  assert!(timeline.peak() <= 2);
}
