//! Dependencies and outputs discovered while building.

use minicons_lib::{BuildContext, BuildOutcome, Builder, BuilderError, Environment, FnBuilder, NodeSpec, TargetStatus};

use super::common::{Counter, Tree, build};

/// Copies `main.c` to its target and declares every `#include "x"` line as
/// a dynamic source.
fn scanner(counter: &Counter) -> impl Builder + 'static {
  let counter = counter.clone();
  FnBuilder::new("scan", move |ctx: &mut BuildContext| {
    counter.bump();
    let source = ctx.source_paths().next().map(|p| p.to_path_buf()).ok_or_else(|| BuilderError::msg("no source"))?;
    let text = std::fs::read_to_string(&source)?;
    let dir = source.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    for line in text.lines() {
      if let Some(name) = line.strip_prefix("#include ") {
        ctx.add_dynamic_source(NodeSpec::file(dir.join(name.trim_matches('"'))))?;
      }
    }
    let target = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
    std::fs::write(target, &text)?;
    Ok(BuildOutcome::Built)
  })
}

fn declare_scan(tree: &Tree, counter: &Counter) -> Environment {
  let mut env = tree.env();
  let main = env.file("main.c").unwrap();
  let obj = env.file("main.o").unwrap();
  env.register_builder(scanner(counter), &[obj], &[main]).unwrap();
  env
}

#[test]
fn discovered_sources_persist_across_runs() {
  let tree = Tree::new();
  tree.write("main.c", "#include \"util.h\"\nint main;\n");
  tree.write("util.h", "int helper;\n");
  let counter = Counter::default();

  build(&mut declare_scan(&tree, &counter), &["main.o"]);
  assert_eq!(counter.get(), 1);

  // nothing changed: the recorded header is checked and found equal
  let report = build(&mut declare_scan(&tree, &counter), &["main.o"]);
  assert_eq!(report.invocations, 0);

  // only the header changes; no static edge mentions it
  tree.write("util.h", "int helper(void);\n");
  let mut env = declare_scan(&tree, &counter);
  let prepared = env.prepare(&["main.o"]).unwrap();
  let util = env.resolve("util.h").unwrap();
  assert!(prepared.closure().contains(&util));
  let report = build(&mut env, &["main.o"]);
  assert_eq!(report.status("main.o"), Some(&TargetStatus::Built));
  assert_eq!(counter.get(), 2);
}

#[test]
fn dropped_includes_are_forgotten() {
  let tree = Tree::new();
  tree.write("main.c", "#include \"old.h\"\n");
  tree.write("old.h", "");
  let counter = Counter::default();
  build(&mut declare_scan(&tree, &counter), &["main.o"]);

  tree.write("main.c", "int main;\n");
  build(&mut declare_scan(&tree, &counter), &["main.o"]);

  // old.h no longer matters
  tree.remove("old.h");
  let report = build(&mut declare_scan(&tree, &counter), &["main.o"]);
  assert_eq!(report.invocations, 0);
  assert!(report.is_success());
}

/// Reads `objs.manifest` (one name per line), writes each listed object
/// under `obj/`, and writes the list itself to its static target.
fn unpacker(counter: &Counter) -> impl Builder + 'static {
  let counter = counter.clone();
  FnBuilder::new("unpack", move |ctx: &mut BuildContext| {
    counter.bump();
    let manifest = ctx.source_paths().next().map(|p| p.to_path_buf()).ok_or_else(|| BuilderError::msg("no manifest"))?;
    let listing = std::fs::read_to_string(manifest)?;
    let out_dir = ctx.root().join("obj");
    std::fs::create_dir_all(&out_dir)?;
    for name in listing.lines().filter(|l| !l.is_empty()) {
      let path = out_dir.join(name);
      std::fs::write(&path, format!("object {}", name))?;
      ctx.add_dynamic_target(NodeSpec::file(path))?;
    }
    let list = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
    std::fs::write(list, &listing)?;
    Ok(BuildOutcome::Built)
  })
}

fn declare_unpack(tree: &Tree, counter: &Counter) -> Environment {
  let mut env = tree.env();
  let manifest = env.file("objs.manifest").unwrap();
  let list = env.file("obj/list.txt").unwrap();
  env.register_builder(unpacker(counter), &[list], &[manifest]).unwrap();
  env.register_alias("objs", &[list]).unwrap();
  env
}

#[test]
fn dynamic_targets_join_the_alias_closure() {
  let tree = Tree::new();
  tree.write("objs.manifest", "a.o\nb.o\n");
  let counter = Counter::default();

  let mut env = declare_unpack(&tree, &counter);
  let report = build(&mut env, &["objs"]);
  assert_eq!(report.status("objs"), Some(&TargetStatus::Built));
  assert_eq!(report.status("obj/a.o"), Some(&TargetStatus::Built));
  assert_eq!(report.status("obj/b.o"), Some(&TargetStatus::Built));

  // construction only, and the manifest is gone
  tree.remove("objs.manifest");
  let mut env = declare_unpack(&tree, &counter);
  let prepared = env.prepare(&["objs"]).unwrap();
  let a = env.resolve("obj/a.o").unwrap();
  let b = env.resolve("obj/b.o").unwrap();
  assert!(prepared.closure().contains(&a));
  assert!(prepared.closure().contains(&b));

  let builder = env.producer(a).unwrap();
  assert_eq!(env.producer(b), Some(builder));
  assert_eq!(env.builder_targets(builder).len(), 3);
  assert_eq!(counter.get(), 1);
}

#[test]
fn deleted_dynamic_outputs_are_rebuilt() {
  let tree = Tree::new();
  tree.write("objs.manifest", "a.o\n");
  let counter = Counter::default();
  build(&mut declare_unpack(&tree, &counter), &["objs"]);

  tree.remove("obj/a.o");
  let report = build(&mut declare_unpack(&tree, &counter), &["objs"]);
  assert_eq!(report.status("obj/a.o"), Some(&TargetStatus::Built));
  assert_eq!(counter.get(), 2);
}

#[test]
fn discovered_targets_cannot_steal_outputs() {
  let tree = Tree::new();
  tree.write("objs.manifest", "taken.o\n");
  let counter = Counter::default();
  let mut env = declare_unpack(&tree, &counter);
  let taken = env.file("obj/taken.o").unwrap();
  let owner_counter = Counter::default();
  env
    .register_builder(
      FnBuilder::new("owner", move |ctx: &mut BuildContext| {
        owner_counter.bump();
        let path = ctx.target_path().ok_or_else(|| BuilderError::msg("no target"))?;
        std::fs::write(path, "mine")?;
        Ok(BuildOutcome::Built)
      }),
      &[taken],
      &[],
    )
    .unwrap();

  let report = build(&mut env, &["objs"]);
  match report.status("objs") {
    Some(TargetStatus::Failed { error }) => assert!(error.contains("already built by owner"), "{error}"),
    other => panic!("expected a failure, got {other:?}"),
  }
}
