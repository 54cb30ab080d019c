//! Scheduling: memoization, concurrency, failures and sessions.

use std::sync::Arc;
use std::time::Duration;

use cairn_lib::engine::{EngineError, Failure, RuleError, Value, arg};
use cairn_lib::rules::{Rule, RuleGraphBuilder, TypeId};
use parking_lot::Mutex;
use tempfile::TempDir;

use super::common::{Counter, Fib, map_rule, scheduler};

fn chain(to_string: &Counter, to_len: &Counter) -> RuleGraphBuilder {
  RuleGraphBuilder::new()
    .rule(map_rule::<i64, String, _>("to_string", to_string, |n| n.to_string()))
    .rule(map_rule::<String, usize, _>("to_len", to_len, |s| s.len()))
    .query::<usize>(&[TypeId::of::<i64>()])
    .query::<String>(&[TypeId::of::<i64>()])
}

#[tokio::test]
async fn chained_rules_run_once_per_input() {
  let root = TempDir::new().unwrap();
  let (to_string, to_len) = (Counter::default(), Counter::default());
  let scheduler = scheduler(chain(&to_string, &to_len), root.path());
  let session = scheduler.session();

  let len = session.request::<usize>(vec![Value::new(12345_i64)]).await.unwrap();
  assert_eq!(*len, 5);
  let again = session.request::<usize>(vec![Value::new(12345_i64)]).await.unwrap();
  assert_eq!(*again, 5);
  assert_eq!((to_string.get(), to_len.get()), (1, 1));

  // The intermediate node is shared with the direct query.
  let text = session.request::<String>(vec![Value::new(12345_i64)]).await.unwrap();
  assert_eq!(*text, "12345");
  assert_eq!(to_string.get(), 1);
}

#[tokio::test]
async fn dependencies_finish_before_dependents() {
  let root = TempDir::new().unwrap();
  let order = Arc::new(Mutex::new(Vec::new()));
  let first = {
    let order = Arc::clone(&order);
    Rule::new("first", TypeId::of::<String>())
      .param::<i64>()
      .run(move |_ctx, args| {
        let order = Arc::clone(&order);
        async move {
          tokio::time::sleep(Duration::from_millis(20)).await;
          order.lock().push("first");
          Ok(Value::new(arg::<i64>(&args, 0)?.to_string()))
        }
      })
  };
  let second = {
    let order = Arc::clone(&order);
    Rule::new("second", TypeId::of::<bool>())
      .param::<String>()
      .run(move |_ctx, args| {
        let order = Arc::clone(&order);
        async move {
          order.lock().push("second");
          Ok(Value::new(!arg::<String>(&args, 0)?.is_empty()))
        }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(first)
    .rule(second)
    .query::<bool>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  let result = scheduler
    .session()
    .request::<bool>(vec![Value::new(1_i64)])
    .await
    .unwrap();
  assert!(*result);
  assert_eq!(*order.lock(), vec!["first", "second"]);
}

#[tokio::test]
async fn results_survive_across_sessions() {
  let root = TempDir::new().unwrap();
  let (to_string, to_len) = (Counter::default(), Counter::default());
  let scheduler = scheduler(chain(&to_string, &to_len), root.path());

  scheduler.session().request::<usize>(vec![Value::new(7_i64)]).await.unwrap();
  scheduler.session().request::<usize>(vec![Value::new(7_i64)]).await.unwrap();
  assert_eq!((to_string.get(), to_len.get()), (1, 1));

  scheduler.session().request::<usize>(vec![Value::new(8_i64)]).await.unwrap();
  assert_eq!((to_string.get(), to_len.get()), (2, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_run() {
  let root = TempDir::new().unwrap();
  let counter = Counter::default();
  let slow = {
    let counter = counter.clone();
    Rule::new("slow", TypeId::of::<String>())
      .param::<i64>()
      .run(move |_ctx, args| {
        let counter = counter.clone();
        async move {
          counter.bump();
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(Value::new(format!("value {}", arg::<i64>(&args, 0)?)))
        }
      })
  };
  let scheduler = scheduler(
    RuleGraphBuilder::new()
      .rule(slow)
      .query::<String>(&[TypeId::of::<i64>()]),
    root.path(),
  );
  let (left, right) = (scheduler.session(), scheduler.session());

  let (a, b) = tokio::join!(
    left.request_many::<String>(vec![vec![Value::new(3_i64)], vec![Value::new(4_i64)]]),
    right.request_many::<String>(vec![vec![Value::new(3_i64)]]),
  );
  let (a, b) = (a.unwrap(), b.unwrap());
  assert_eq!(*a[0], "value 3");
  assert_eq!(*a[1], "value 4");
  assert!(Arc::ptr_eq(&a[0], &b[0]));
  assert_eq!(counter.get(), 2);
}

fn fib_rule(counter: &Counter) -> Rule {
  let counter = counter.clone();
  Rule::new("fib", TypeId::of::<u64>())
    .param::<Fib>()
    .get::<u64, Fib>()
    .run(move |ctx, args| {
      let counter = counter.clone();
      async move {
        counter.bump();
        let n = arg::<Fib>(&args, 0)?.0;
        if n < 2 {
          return Ok(Value::new(n));
        }
        let (a, b) = futures::try_join!(ctx.get::<u64, Fib>(Fib(n - 1)), ctx.get::<u64, Fib>(Fib(n - 2)))?;
        Ok(Value::new(*a + *b))
      }
    })
}

#[tokio::test]
async fn recursive_rules_memoize_each_subproblem() {
  let root = TempDir::new().unwrap();
  let counter = Counter::default();
  let builder = RuleGraphBuilder::new()
    .rule(fib_rule(&counter))
    .query::<u64>(&[TypeId::of::<Fib>()]);
  let scheduler = scheduler(builder, root.path());

  let value = scheduler.session().request::<u64>(vec![Value::new(Fib(30))]).await.unwrap();
  assert_eq!(*value, 832_040);
  assert_eq!(counter.get(), 31);
}

#[tokio::test]
async fn runtime_cycle_fails_instead_of_hanging() {
  let root = TempDir::new().unwrap();
  let looping = Rule::new("looping", TypeId::of::<u64>())
    .param::<Fib>()
    .get::<u64, Fib>()
    .run(|ctx, args| async move {
      let n = arg::<Fib>(&args, 0)?.0;
      // 3 -> 2 -> 3
      let next = if n == 3 { 2 } else { 3 };
      let value = ctx.get::<u64, Fib>(Fib(next)).await?;
      Ok(Value::new(*value))
    });
  let builder = RuleGraphBuilder::new()
    .rule(looping)
    .query::<u64>(&[TypeId::of::<Fib>()]);
  let scheduler = scheduler(builder, root.path());

  let session = scheduler.session();
  let request = session.request::<u64>(vec![Value::new(Fib(3))]);
  let err = tokio::time::timeout(Duration::from_secs(5), request)
    .await
    .expect("cycle must not hang")
    .unwrap_err();
  match err {
    Failure::Cycle { path } => {
      assert!(path.len() >= 2, "{path:?}");
      assert!(path.iter().all(|frame| frame.starts_with("looping")), "{path:?}");
    }
    other => panic!("expected a cycle, got {other:?}"),
  }
}

#[tokio::test]
async fn failures_carry_a_traceback() {
  let root = TempDir::new().unwrap();
  let inner = Rule::new("inner", TypeId::of::<String>())
    .param::<i64>()
    .run(|_ctx, _args| async { Err(Failure::msg("inner exploded")) });
  let outer = map_rule::<String, bool, _>("outer", &Counter::default(), |s| s.is_empty());
  let builder = RuleGraphBuilder::new()
    .rule(inner)
    .rule(outer)
    .query::<bool>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  let err = scheduler
    .session()
    .request::<bool>(vec![Value::new(1_i64)])
    .await
    .unwrap_err();
  assert!(err.downcast_ref::<RuleError>().is_some());
  let traceback = err.traceback();
  assert_eq!(traceback.len(), 2, "{traceback:?}");
  assert!(traceback[0].starts_with("inner"));
  assert!(traceback[1].starts_with("outer"));

  let rendered = err.render();
  assert!(rendered.contains("inner exploded"));
  assert!(rendered.contains("Traceback"));
}

#[tokio::test]
async fn failures_are_memoized() {
  let root = TempDir::new().unwrap();
  let counter = Counter::default();
  let failing = {
    let counter = counter.clone();
    Rule::new("failing", TypeId::of::<String>())
      .param::<i64>()
      .run(move |_ctx, _args| {
        let counter = counter.clone();
        async move {
          counter.bump();
          Err(Failure::msg("nope"))
        }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(failing)
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());
  let session = scheduler.session();

  session.request::<String>(vec![Value::new(1_i64)]).await.unwrap_err();
  session.request::<String>(vec![Value::new(1_i64)]).await.unwrap_err();
  assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn undeclared_requests_are_rejected() {
  let root = TempDir::new().unwrap();
  let sneaky = Rule::new("sneaky", TypeId::of::<bool>())
    .param::<i64>()
    .run(|ctx, _args| async move {
      let value = ctx.get::<String, u8>(1).await?;
      Ok(Value::new(value.is_empty()))
    });
  let builder = RuleGraphBuilder::new()
    .rule(sneaky)
    .rule(map_rule::<u8, String, _>("u8_to_string", &Counter::default(), |n| n.to_string()))
    .query::<bool>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  let err = scheduler
    .session()
    .request::<bool>(vec![Value::new(1_i64)])
    .await
    .unwrap_err();
  assert!(
    matches!(err.downcast_ref::<EngineError>(), Some(EngineError::UndeclaredDependency { rule, .. }) if rule == "sneaky"),
    "{err:?}"
  );
}

#[tokio::test]
async fn requests_must_match_a_declared_query() {
  let root = TempDir::new().unwrap();
  let (to_string, to_len) = (Counter::default(), Counter::default());
  let scheduler = scheduler(chain(&to_string, &to_len), root.path());

  let err = scheduler
    .session()
    .request::<usize>(vec![Value::new(true)])
    .await
    .unwrap_err();
  assert!(
    matches!(err.downcast_ref::<EngineError>(), Some(EngineError::MissingQuery { .. })),
    "{err:?}"
  );
  assert_eq!(to_string.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_failure_does_not_poison_other_nodes() {
  let root = TempDir::new().unwrap();
  let counter = Counter::default();
  let maybe_fail = {
    let counter = counter.clone();
    Rule::new("maybe_fail", TypeId::of::<String>())
      .param::<i64>()
      .run(move |_ctx, args| {
        let counter = counter.clone();
        async move {
          counter.bump();
          let n = *arg::<i64>(&args, 0)?;
          if n == 0 {
            return Err(Failure::msg("zero"));
          }
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok(Value::new(n.to_string()))
        }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(maybe_fail)
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());
  let session = scheduler.session();

  let err = session
    .request_many::<String>(vec![vec![Value::new(0_i64)], vec![Value::new(1_i64)]])
    .await
    .unwrap_err();
  assert_eq!(err.to_string(), "zero");

  tokio::time::sleep(Duration::from_millis(100)).await;
  let value = session.request::<String>(vec![Value::new(1_i64)]).await.unwrap();
  assert_eq!(*value, "1");
  assert_eq!(counter.get(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_requests_cancel_their_nodes() {
  let root = TempDir::new().unwrap();
  let (started, finished) = (Counter::default(), Counter::default());
  let slow = {
    let (started, finished) = (started.clone(), finished.clone());
    Rule::new("slow", TypeId::of::<String>())
      .param::<i64>()
      .run(move |_ctx, _args| {
        let (started, finished) = (started.clone(), finished.clone());
        async move {
          started.bump();
          tokio::time::sleep(Duration::from_millis(100)).await;
          finished.bump();
          Ok(Value::new("done".to_string()))
        }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(slow)
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());
  let session = scheduler.session();

  let abandoned = tokio::time::timeout(
    Duration::from_millis(20),
    session.request::<String>(vec![Value::new(1_i64)]),
  )
  .await;
  assert!(abandoned.is_err());
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!((started.get(), finished.get()), (1, 0));

  let value = session.request::<String>(vec![Value::new(1_i64)]).await.unwrap();
  assert_eq!(*value, "done");
  assert_eq!((started.get(), finished.get()), (2, 1));
}

#[tokio::test]
async fn uncacheable_rules_rerun_per_session() {
  let root = TempDir::new().unwrap();
  let (clock, describe) = (Counter::default(), Counter::default());
  let tick = {
    let clock = clock.clone();
    Rule::new("tick", TypeId::of::<u64>())
      .param::<i64>()
      .uncacheable()
      .run(move |_ctx, _args| {
        let clock = clock.clone();
        async move { Ok(Value::new(clock.bump() as u64)) }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(tick)
    .rule(map_rule::<u64, String, _>("describe", &describe, |t| format!("tick {t}")))
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  let first = scheduler.session();
  let a = first.request::<String>(vec![Value::new(0_i64)]).await.unwrap();
  let b = first.request::<String>(vec![Value::new(0_i64)]).await.unwrap();
  assert_eq!((a.as_str(), b.as_str()), ("tick 1", "tick 1"));
  assert_eq!((clock.get(), describe.get()), (1, 1));

  // Dependents of an uncacheable result are recomputed too.
  let c = scheduler
    .session()
    .request::<String>(vec![Value::new(0_i64)])
    .await
    .unwrap();
  assert_eq!(*c, "tick 2");
  assert_eq!((clock.get(), describe.get()), (2, 2));
}
