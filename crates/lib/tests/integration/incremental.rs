//! Staleness detection across runs.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use minicons_lib::{
  BlockCause, BuildContext, BuildOutcome, Builder, BuilderError, EnvConfig, Environment, FnBuilder, SignatureMode,
  StaleReason, TargetStatus,
};
use tracing_test::traced_test;

use super::common::{Counter, Tree, assert_exists, build, concat};

#[test]
fn out_bin_follows_in_txt() {
  let tree = Tree::new();
  tree.write("in.txt", "first");
  let counter = Counter::default();
  let mut env = tree.env();
  let input = env.file("in.txt").unwrap();
  let output = env.file("out.bin").unwrap();
  env.register_builder(concat("pack", &counter), &[output], &[input]).unwrap();

  let report = build(&mut env, &["out.bin"]);
  assert_exists(&tree.path("out.bin"));
  assert_eq!(report.built(), 1);
  assert_eq!(report.status("out.bin"), Some(&TargetStatus::Built));

  tree.write("in.txt", "second");
  let report = build(&mut env, &["out.bin"]);
  assert_eq!(report.built(), 1);
  assert_eq!(tree.read("out.bin"), "second");

  let report = build(&mut env, &["out.bin"]);
  assert_eq!(report.built(), 0);
  assert_eq!(report.up_to_date(), 1);
  assert_eq!(report.invocations, 0);
  assert_eq!(counter.get(), 2);
}

#[test]
fn second_run_without_changes_does_nothing() {
  let tree = Tree::new();
  tree.write("a.txt", "a");
  let counter = Counter::default();

  let declare = |env: &mut Environment| {
    let a = env.file("a.txt").unwrap();
    let b = env.file("b.txt").unwrap();
    let c = env.file("c.txt").unwrap();
    env.register_builder(concat("b", &counter), &[b], &[a]).unwrap();
    env.register_builder(concat("c", &counter), &[c], &[b]).unwrap();
  };

  let mut env = tree.env();
  declare(&mut env);
  assert_eq!(build(&mut env, &["c.txt"]).invocations, 2);

  // a new process sees the same tree as up to date
  let mut env = tree.env();
  declare(&mut env);
  let report = build(&mut env, &["c.txt"]);
  assert_eq!(report.invocations, 0);
  assert!(report.targets.values().all(|s| *s == TargetStatus::UpToDate));
  assert_eq!(counter.get(), 2);
}

#[test]
fn staleness_propagates_to_dependents() {
  let tree = Tree::new();
  tree.write("src.txt", "v1");
  let counter = Counter::default();
  let mut env = tree.env();
  let src = env.file("src.txt").unwrap();
  let mid = env.file("mid.txt").unwrap();
  let top = env.file("top.txt").unwrap();
  env.register_builder(concat("mid", &counter), &[mid], &[src]).unwrap();
  env.register_builder(concat("top", &counter), &[top], &[mid]).unwrap();
  build(&mut env, &["top.txt"]);

  tree.write("src.txt", "v2");
  let prepared = env.prepare(&["top.txt"]).unwrap();
  assert!(matches!(prepared.stale_reason(mid), Some(StaleReason::DependencyChanged(_))));
  assert_eq!(
    prepared.stale_reason(top),
    Some(&StaleReason::DependencyStale("mid.txt".to_string()))
  );

  let report = build(&mut env, &["top.txt"]);
  assert_eq!(report.built(), 2);
  assert_eq!(tree.read("top.txt"), "v2");
}

/// Writes a summary line that embeds a run number, but reports `Unchanged`
/// when the meaningful part (the source length) is the same as last time.
fn summarize(counter: &Counter) -> impl Builder + 'static {
  let counter = counter.clone();
  let last_len = Arc::new(Mutex::new(None::<usize>));
  FnBuilder::new("summarize", move |ctx: &mut BuildContext| {
    counter.bump();
    let len: usize = ctx
      .source_paths()
      .map(|p| std::fs::read(p).map(|b| b.len()))
      .sum::<Result<usize, _>>()?;
    let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
    let same = last_len.lock().unwrap().replace(len) == Some(len);
    std::fs::write(path, format!("len={};run={}", len, counter.get()))?;
    Ok(if same { BuildOutcome::Unchanged } else { BuildOutcome::Built })
  })
}

#[test]
fn unchanged_outputs_do_not_rebuild_dependents() {
  let tree = Tree::new();
  tree.write("data.txt", "abc");
  let summaries = Counter::default();
  let reports = Counter::default();
  let mut env = tree.env();
  let data = env.file("data.txt").unwrap();
  let summary = env.file("summary.txt").unwrap();
  let report_file = env.file("report.txt").unwrap();
  env.register_builder(summarize(&summaries), &[summary], &[data]).unwrap();
  env
    .register_builder(concat("report", &reports), &[report_file], &[summary])
    .unwrap();
  build(&mut env, &["report.txt"]);
  assert_eq!((summaries.get(), reports.get()), (1, 1));

  // same length: the summary is rewritten but declared unchanged
  tree.write("data.txt", "xyz");
  let report = build(&mut env, &["report.txt"]);
  assert_eq!(report.status("summary.txt"), Some(&TargetStatus::Unchanged));
  assert_eq!(report.status("report.txt"), Some(&TargetStatus::UpToDate));
  assert_eq!((summaries.get(), reports.get()), (2, 1));

  // and the next run has nothing left to do
  let report = build(&mut env, &["report.txt"]);
  assert_eq!(report.invocations, 0);

  // a real change still flows through
  tree.write("data.txt", "longer");
  let report = build(&mut env, &["report.txt"]);
  assert_eq!(report.status("report.txt"), Some(&TargetStatus::Built));
  assert_eq!((summaries.get(), reports.get()), (3, 2));
}

#[test]
fn dependents_of_a_rebuilt_builder_always_run() {
  let tree = Tree::new();
  tree.write("note.txt", "v1");
  let counter = Counter::default();
  let mut env = tree.env();
  let note = env.file("note.txt").unwrap();
  let banner = env.file("banner.txt").unwrap();
  let page = env.file("page.txt").unwrap();
  let stamps = counter.clone();
  let stamp = FnBuilder::new("banner", move |ctx: &mut BuildContext| {
    stamps.bump();
    let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
    std::fs::write(path, "same banner every time")?;
    Ok(BuildOutcome::Built)
  });
  env.register_builder(stamp, &[banner], &[note]).unwrap();
  env.register_builder(concat("page", &counter), &[page], &[banner]).unwrap();
  build(&mut env, &["page.txt"]);
  assert_eq!(counter.get(), 2);

  // banner.txt comes out byte-identical, but its builder said Built
  tree.write("note.txt", "v2");
  let report = build(&mut env, &["page.txt"]);
  assert_eq!(report.status("banner.txt"), Some(&TargetStatus::Built));
  assert_eq!(report.status("page.txt"), Some(&TargetStatus::Built));
  assert_eq!(counter.get(), 4);
}

#[test]
fn previous_outputs_never_pass_for_fresh_ones() {
  let tree = Tree::new();
  tree.write("in.txt", "one");
  let counter = Counter::default();
  let mut env = tree.env();
  let input = env.file("in.txt").unwrap();
  let output = env.file("out.txt").unwrap();
  let runs = counter.clone();
  let first_run_only = FnBuilder::new("once", move |ctx: &mut BuildContext| {
    runs.bump();
    if runs.get() == 1 {
      let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
      std::fs::write(path, "from the first run")?;
    }
    Ok(BuildOutcome::Built)
  });
  env.register_builder(first_run_only, &[output], &[input]).unwrap();
  build(&mut env, &["out.txt"]);
  assert_eq!(tree.read("out.txt"), "from the first run");

  tree.write("in.txt", "two");
  let report = build(&mut env, &["out.txt"]);
  match report.status("out.txt") {
    Some(TargetStatus::Failed { error }) => assert!(error.contains("does not exist"), "{error}"),
    other => panic!("expected a missing output, got {other:?}"),
  }
  assert!(!tree.path("out.txt").exists());
  assert_eq!(env.is_stale(output).unwrap(), Some(StaleReason::Missing));
  assert_eq!(counter.get(), 2);
}

#[test]
#[traced_test]
fn unusable_state_directory_rebuilds_everything() {
  let tree = Tree::new();
  tree.write("in.txt", "x");
  tree.write("blocker", "a file where the state directory should go");
  let counter = Counter::default();
  let declare = || {
    let config = EnvConfig::new(tree.root()).with_state_dir(tree.path("blocker/state"));
    let mut env = Environment::new(config);
    let input = env.file("in.txt").unwrap();
    let output = env.file("out.txt").unwrap();
    env.register_builder(concat("gen", &counter), &[output], &[input]).unwrap();
    env
  };

  let report = build(&mut declare(), &["out.txt"]);
  assert_eq!(report.status("out.txt"), Some(&TargetStatus::Built));
  assert_eq!(tree.read("out.txt"), "x");

  // nothing could be recorded, so the next run starts from scratch again
  let report = build(&mut declare(), &["out.txt"]);
  assert_eq!(report.status("out.txt"), Some(&TargetStatus::Built));
  assert_eq!(counter.get(), 2);
  assert!(logs_contain("state directory is unusable"));
  assert!(logs_contain("failed to persist signature record"));
}

#[test]
fn configuration_changes_trigger_rebuilds() {
  let tree = Tree::new();
  tree.write("in.txt", "x");
  let counter = Counter::default();

  let declare = |opt: &str| {
    let mut env = tree.env();
    let input = env.file("in.txt").unwrap();
    let output = env.file("out.txt").unwrap();
    let counter = counter.clone();
    let builder = FnBuilder::new("cc", move |ctx: &mut BuildContext| {
      counter.bump();
      let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
      std::fs::write(path, "obj")?;
      Ok(BuildOutcome::Built)
    })
    .with_config(serde_json::json!({ "opt": opt }));
    env.register_builder(builder, &[output], &[input]).unwrap();
    (env, output)
  };

  let (mut env, _) = declare("-O0");
  build(&mut env, &["out.txt"]);

  let (mut env, output) = declare("-O2");
  assert_eq!(env.is_stale(output).unwrap(), Some(StaleReason::ConfigChanged));
  build(&mut env, &["out.txt"]);
  assert_eq!(counter.get(), 2);

  let (mut env, output) = declare("-O2");
  assert_eq!(env.is_stale(output).unwrap(), None);
}

#[test]
fn value_nodes_are_dependencies() {
  let tree = Tree::new();
  let counter = Counter::default();

  let declare = |flags: serde_json::Value| {
    let mut env = tree.env();
    let value = env.value("cc", "flags", flags).unwrap();
    let output = env.file("flags.txt").unwrap();
    let counter = counter.clone();
    let builder = FnBuilder::new("flags", move |ctx: &mut BuildContext| {
      counter.bump();
      let flags = ctx.sources()[0].value.clone().unwrap_or_default();
      let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
      std::fs::write(path, flags.to_string())?;
      Ok(BuildOutcome::Built)
    });
    env.register_builder(builder, &[output], &[value]).unwrap();
    env
  };

  build(&mut declare(serde_json::json!(["-O2"])), &["flags.txt"]);
  build(&mut declare(serde_json::json!(["-O2"])), &["flags.txt"]);
  assert_eq!(counter.get(), 1);

  build(&mut declare(serde_json::json!(["-O3"])), &["flags.txt"]);
  assert_eq!(counter.get(), 2);
  assert_eq!(tree.read("flags.txt"), r#"["-O3"]"#);
}

#[test]
fn hand_edited_outputs_are_rebuilt() {
  let tree = Tree::new();
  tree.write("in.txt", "generated");
  let counter = Counter::default();
  let mut env = tree.env();
  let input = env.file("in.txt").unwrap();
  let output = env.file("out.txt").unwrap();
  env.register_builder(concat("gen", &counter), &[output], &[input]).unwrap();
  build(&mut env, &["out.txt"]);

  tree.write("out.txt", "edited by hand");
  assert_eq!(env.is_stale(output).unwrap(), Some(StaleReason::SignatureChanged));
  build(&mut env, &["out.txt"]);
  assert_eq!(tree.read("out.txt"), "generated");

  tree.remove("out.txt");
  assert_eq!(env.is_stale(output).unwrap(), Some(StaleReason::Missing));
  build(&mut env, &["out.txt"]);
  assert_eq!(counter.get(), 3);
}

#[test]
#[traced_test]
fn corrupt_records_are_rebuilt() {
  let tree = Tree::new();
  tree.write("in.txt", "x");
  let counter = Counter::default();
  let mut env = tree.env();
  let input = env.file("in.txt").unwrap();
  let output = env.file("out.txt").unwrap();
  env.register_builder(concat("gen", &counter), &[output], &[input]).unwrap();
  build(&mut env, &["out.txt"]);

  let identity = env.node_info(output).unwrap().identity;
  std::fs::write(env.store().record_path(&identity), "{ truncated").unwrap();

  let report = build(&mut env, &["out.txt"]);
  assert_eq!(report.status("out.txt"), Some(&TargetStatus::Built));
  assert!(logs_contain("ignoring unreadable signature record"));

  // the rebuild wrote a fresh record
  assert!(env.store().lookup(&identity).is_some());
}

#[test]
fn missing_sources_block_only_their_branch() {
  let tree = Tree::new();
  tree.write("present.txt", "here");
  let counter = Counter::default();
  let mut env = tree.env();
  let present = env.file("present.txt").unwrap();
  let absent = env.file("absent.txt").unwrap();
  let ok = env.file("ok.txt").unwrap();
  let broken = env.file("broken.txt").unwrap();
  let after = env.file("after.txt").unwrap();
  env.register_builder(concat("broken", &counter), &[broken], &[absent]).unwrap();
  env.register_builder(concat("after", &counter), &[after], &[broken]).unwrap();
  env.register_builder(concat("ok", &counter), &[ok], &[present]).unwrap();

  let report = build(&mut env, &["ok.txt", "after.txt"]);
  assert_eq!(report.status("ok.txt"), Some(&TargetStatus::Built));
  let cause = BlockCause::MissingSource {
    node: "absent.txt".to_string(),
  };
  assert_eq!(report.status("broken.txt"), Some(&TargetStatus::Blocked { cause: cause.clone() }));
  assert_eq!(report.status("after.txt"), Some(&TargetStatus::Blocked { cause }));
  assert_eq!(report.missing, vec!["absent.txt".to_string()]);
  assert!(!report.is_success());
  assert_eq!(counter.get(), 1);
}

#[test]
fn requesting_a_missing_plain_source_is_reported() {
  let tree = Tree::new();
  let mut env = tree.env();
  env.file("nowhere.txt").unwrap();
  let report = build(&mut env, &["nowhere.txt"]);
  assert!(matches!(report.status("nowhere.txt"), Some(TargetStatus::Blocked { .. })));
  assert_eq!(report.missing, vec!["nowhere.txt".to_string()]);
}

#[test]
fn timestamp_mode_tracks_modification_times() {
  let tree = Tree::new();
  tree.write("in.txt", "same");
  let counter = Counter::default();
  let declare = || {
    let mut env = Environment::new(EnvConfig::new(tree.root()).with_signature_mode(SignatureMode::Timestamp));
    let input = env.file("in.txt").unwrap();
    let output = env.file("out.txt").unwrap();
    env.register_builder(concat("copy", &counter), &[output], &[input]).unwrap();
    env
  };

  build(&mut declare(), &["out.txt"]);
  build(&mut declare(), &["out.txt"]);
  assert_eq!(counter.get(), 1);

  // identical content, newer mtime
  let file = std::fs::File::options().write(true).open(tree.path("in.txt")).unwrap();
  file
    .set_modified(SystemTime::now() + Duration::from_secs(10))
    .unwrap();
  drop(file);
  build(&mut declare(), &["out.txt"]);
  assert_eq!(counter.get(), 2);
}
