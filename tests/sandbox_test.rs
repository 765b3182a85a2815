//! End-to-end runs through real isolates. None of these need network access.

use std::time::{Duration, Instant};

use npm_runner::{
    CdnEndpoint, LogEntry, LogKind, RunStart, RunState, RunnerConfig, Session, NOTHING_TO_RUN,
};

async fn run_to_completion(config: &RunnerConfig, source: &str) -> Session {
    let mut session = Session::new(config).unwrap();
    let start = session.run(source);
    assert!(matches!(start, RunStart::Started(_)), "{start:?}");

    tokio::time::timeout(Duration::from_secs(20), session.settle())
        .await
        .expect("run did not settle");
    session
}

fn texts(session: &Session, kind: LogKind) -> Vec<String> {
    session
        .logs()
        .iter()
        .filter(|entry| entry.kind == kind)
        .map(|entry| entry.text.clone())
        .collect()
}

#[tokio::test]
async fn test_console_output() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "console.log('hello', 42);\nconsole.info({ a: 1 });\nconsole.log(null);",
    )
    .await;

    assert_eq!(
        session.logs(),
        &[
            LogEntry::log("hello"),
            LogEntry::log("42"),
            LogEntry::log("{\n  \"a\": 1\n}"),
            LogEntry::log(""),
        ]
    );
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_thrown_error() {
    let session = run_to_completion(&RunnerConfig::default(), "throw new Error('boom');").await;

    assert_eq!(texts(&session, LogKind::Error), vec!["boom".to_string()]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_warn_is_error() {
    let session = run_to_completion(&RunnerConfig::default(), "console.warn('careful');").await;

    assert_eq!(session.logs(), &[LogEntry::error("careful")]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_circular_object() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "const a = { name: 'a' };\na.self = a;\nconsole.log(a);",
    )
    .await;

    let logs = texts(&session, LogKind::Log);
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("[Circular]"), "{}", logs[0]);
    assert!(logs[0].contains("\"name\": \"a\""), "{}", logs[0]);
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_unknown_message_is_ignored() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "parent.postMessage({ type: 'unknown-kind' }, '*');\nconsole.log('after');",
    )
    .await;

    assert_eq!(session.logs(), &[LogEntry::log("after")]);
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_nothing_to_run() {
    let mut session = Session::new(&RunnerConfig::default()).unwrap();
    assert_eq!(session.run(""), RunStart::NothingToRun);
    assert_eq!(session.notice(), Some(NOTHING_TO_RUN));
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_syntax_error_without_precheck() {
    let config = RunnerConfig {
        check_syntax: false,
        ..Default::default()
    };
    let session = run_to_completion(&config, "const x = ;").await;

    let errors = texts(&session, LogKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("SyntaxError"), "{}", errors[0]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_timers() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "await new Promise((resolve) => setTimeout(resolve, 20));\nconsole.log('later');",
    )
    .await;

    assert_eq!(session.logs(), &[LogEntry::log("later")]);
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_builtins() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "console.log(btoa('hi'));\nconsole.log(crypto.randomUUID().length);\nconsole.log(typeof process);\nconsole.log(typeof Deno);",
    )
    .await;

    assert_eq!(
        texts(&session, LogKind::Log),
        vec![
            "aGk=".to_string(),
            "36".to_string(),
            "undefined".to_string(),
            "undefined".to_string()
        ]
    );
}

#[tokio::test]
async fn test_no_host_globals_besides_parent() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "for (const name of ['Deno', '__bootstrap', 'process', 'require', 'fetch', 'Bun']) {\n  console.log(name, typeof globalThis[name]);\n}\nconsole.log(typeof parent.postMessage);",
    )
    .await;

    let logs = texts(&session, LogKind::Log);
    assert_eq!(logs.len(), 13);
    for pair in logs[..12].chunks(2) {
        assert_eq!(pair[1], "undefined", "{} is exposed", pair[0]);
    }
    assert_eq!(logs[12], "function");
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_wrapper_escape_runs_only_in_the_sandbox() {
    let config = RunnerConfig {
        timeout_ms: Some(300),
        ..Default::default()
    };
    let mut session = Session::new(&config).unwrap();

    // Closes the document's try block and async wrapper, then loops at module level.
    let started = Instant::now();
    let start = session.run("} finally {} })(); for (;;) {} (async () => { try {");
    assert!(matches!(start, RunStart::Started(_)), "{start:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::timeout(Duration::from_secs(20), session.settle())
        .await
        .expect("run did not settle");

    let errors = texts(&session, LogKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("timed out"), "{}", errors[0]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_cached_package_is_imported() {
    let mut session = Session::new(&RunnerConfig::default()).unwrap();
    let cache = session.host().module_cache();
    cache.insert(
        "https://cdn.skypack.dev/left-pad",
        "https://cdn.skypack.dev/left-pad",
        "export default function pad(text, width) { return String(text).padStart(width); }",
    );
    cache.insert(
        "https://cdn.skypack.dev/tiny-math",
        "https://cdn.skypack.dev/-/tiny-math@1.0.0/index.js",
        "export const double = (n) => n * 2;\nexport const half = (n) => n / 2;",
    );

    session.run(
        "import pad from 'left-pad';\nconst { double, half } = require('tiny-math');\nconsole.log(pad('x', 3));\nconsole.log(double(4), half(4));",
    );
    tokio::time::timeout(Duration::from_secs(20), session.settle())
        .await
        .expect("run did not settle");

    assert_eq!(
        session.logs(),
        &[LogEntry::log("  x"), LogEntry::log("8"), LogEntry::log("2")]
    );
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let config = RunnerConfig {
        timeout_ms: Some(200),
        ..Default::default()
    };
    let session = run_to_completion(&config, "while (true) {}").await;

    let errors = texts(&session, LogKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("timed out"), "{}", errors[0]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_pending_promise_never_settles() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "console.log('waiting');\nawait new Promise(() => {});",
    )
    .await;

    assert_eq!(texts(&session, LogKind::Log), vec!["waiting".to_string()]);
    let errors = texts(&session, LogKind::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("never settled"), "{}", errors[0]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_message_budget() {
    let config = RunnerConfig {
        max_messages: 3,
        ..Default::default()
    };
    let session = run_to_completion(&config, "for (let i = 0; i < 10; i++) console.log(i);").await;

    assert_eq!(
        texts(&session, LogKind::Log),
        vec!["0".to_string(), "1".to_string(), "2".to_string()]
    );
    assert_eq!(session.state(), RunState::Idle);
}

#[tokio::test]
async fn test_disallowed_origin() {
    let session = run_to_completion(
        &RunnerConfig::default(),
        "try {\n  await import('https://evil.example/x.js');\n} catch (e) {\n  console.log('blocked');\n}",
    )
    .await;

    assert_eq!(session.logs(), &[LogEntry::log("blocked")]);
}

#[tokio::test]
async fn test_unreachable_package_falls_back_to_empty_module() {
    let config = RunnerConfig {
        resolvers: vec![
            CdnEndpoint::new("first", "https://127.0.0.1:1/{package}"),
            CdnEndpoint::new("second", "https://127.0.0.1:2/{package}@latest?bundle=true"),
        ],
        ..Default::default()
    };
    let session = run_to_completion(&config, "import mod from 'left-pad';\nconsole.log(mod);").await;

    let errors = texts(&session, LogKind::Error);
    assert_eq!(
        errors.iter().filter(|text| *text == "[Package Error]").count(),
        2
    );
    assert_eq!(errors.iter().filter(|text| *text == "left-pad").count(), 2);
    assert!(errors.iter().any(|text| text.contains("Might be expecting a Node runtime")));
    assert!(errors.iter().any(|text| text.contains("Failed to load")));

    assert_eq!(texts(&session, LogKind::Log), vec!["{}".to_string()]);
    assert_eq!(session.state(), RunState::Errored);
}

#[tokio::test]
async fn test_rapid_reruns() {
    let mut session = Session::new(&RunnerConfig::default()).unwrap();

    let first = session.run("await new Promise((resolve) => setTimeout(resolve, 200));\nconsole.log('first');");
    let second = session.run("console.log('second');");
    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(session.current_run(), second.run_id());

    tokio::time::timeout(Duration::from_secs(20), session.settle())
        .await
        .expect("run did not settle");

    assert_eq!(session.state(), RunState::Idle);
    assert!(session.logs().contains(&LogEntry::log("second")));

    // The superseded run still reports, but cannot change the state.
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.drain();
    assert!(session.logs().contains(&LogEntry::log("first")));
    assert_eq!(session.state(), RunState::Idle);
}
