//! Durability and ordering properties of the conversation store.

use toolchat::logmanager::{LoadOptions, LogManager};
use toolchat::message::{Message, Role};

fn load_readonly(path: &std::path::Path) -> LogManager {
    LogManager::load(
        path,
        LoadOptions {
            lock: false,
            branch: None,
        },
    )
    .unwrap()
}

#[test]
fn append_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("durable");

    let mut manager = LogManager::create(&logdir, vec![Message::system("sys")]).unwrap();
    for i in 0..5 {
        let msg = Message::user(format!("message {i}"));
        manager.append(msg.clone()).unwrap();

        // After every append, a fresh load sees the message as its last.
        let reloaded = load_readonly(&logdir);
        assert_eq!(reloaded.log().last().unwrap(), &msg);
    }
}

#[test]
fn appends_keep_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("ordered");

    let mut manager = LogManager::create(&logdir, vec![]).unwrap();
    let mut expected = Vec::new();
    for i in 0..20 {
        let msg = if i % 2 == 0 {
            Message::user(format!("u{i}"))
        } else {
            Message::assistant(format!("a{i}"))
        };
        manager.append(msg.clone()).unwrap();
        expected.push(msg);
    }
    drop(manager);

    let reloaded = load_readonly(&logdir);
    assert_eq!(reloaded.log().messages(), expected.as_slice());
}

#[test]
fn tool_messages_keep_call_ids_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("calls");

    let mut manager = LogManager::create(&logdir, vec![]).unwrap();
    manager
        .append(Message::assistant("@shell(call_7): {\"code\": \"ls\"}"))
        .unwrap();
    manager
        .append(Message::tool("file listing", "call_7"))
        .unwrap();
    drop(manager);

    let reloaded = load_readonly(&logdir);
    let last = reloaded.log().last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.call_id.as_deref(), Some("call_7"));
}

#[test]
fn fork_is_independent_of_original() {
    let dir = tempfile::tempdir().unwrap();
    let mut original =
        LogManager::create(dir.path().join("orig"), vec![Message::system("sys")]).unwrap();
    original.append(Message::user("shared history")).unwrap();

    let mut forked = original.fork(dir.path().join("copy")).unwrap();
    forked.append(Message::user("only in fork")).unwrap();

    assert_eq!(original.log().len(), 2);
    assert_eq!(forked.log().len(), 3);

    let orig_reloaded = load_readonly(&dir.path().join("orig"));
    assert_eq!(orig_reloaded.log().len(), 2);
}

#[test]
fn branch_files_live_under_branches_dir() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("branchy");
    let mut manager = LogManager::create(&logdir, vec![Message::system("sys")]).unwrap();
    manager.append(Message::user("main tail")).unwrap();
    manager.switch_branch("experiment").unwrap();
    manager.append(Message::user("experimental tail")).unwrap();

    assert!(logdir.join("branches/experiment.jsonl").exists());
    assert_eq!(manager.branches(), vec!["experiment", "main"]);

    // Loading the branch directly sees its tail.
    drop(manager);
    let branch = LogManager::load(
        &logdir,
        LoadOptions {
            lock: false,
            branch: Some("experiment".to_string()),
        },
    )
    .unwrap();
    assert_eq!(branch.log().len(), 3);
    assert_eq!(branch.log().last().unwrap().content, "experimental tail");
}

#[test]
fn pinned_and_hidden_flags_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("flags");
    let mut manager = LogManager::create(&logdir, vec![]).unwrap();
    manager
        .append(Message::system("important context").pinned())
        .unwrap();
    manager
        .append(Message::system("internal note").hidden())
        .unwrap();
    drop(manager);

    let reloaded = load_readonly(&logdir);
    assert!(reloaded.log().messages()[0].pinned);
    assert!(reloaded.log().messages()[1].hide);
}
