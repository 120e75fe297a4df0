//! Session log round-trip laws over real files.

use plover::model::{
    AssistantMessage, ContentBlock, Message, StopReason, TextContent, Usage,
};
use plover::session::{list_sessions, Session, SessionEntry};

fn user(text: &str) -> Message {
    Message::user_text(text)
}

fn assistant(text: &str) -> Message {
    Message::Assistant(AssistantMessage {
        content: vec![ContentBlock::Text(TextContent::new(text))],
        provider: "test".to_string(),
        model: "test".to_string(),
        usage: Usage::default(),
        stop_reason: StopReason::Stop,
        error_message: None,
        timestamp: 0,
    })
}

fn entry_json(entry: &SessionEntry) -> String {
    serde_json::to_string(entry).unwrap()
}

#[test]
fn written_entries_reread_identically() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::create_in_dir(dir.path()).unwrap();
    session.append_message(user("question")).unwrap();
    session.append_message(assistant("answer")).unwrap();
    let path = session.path.clone().unwrap();
    let written: Vec<String> = session.branch().iter().map(|e| entry_json(e)).collect();
    drop(session);

    let reloaded = Session::open(&path).unwrap();
    let reread: Vec<String> = reloaded.branch().iter().map(|e| entry_json(e)).collect();
    assert_eq!(written, reread);
}

#[test]
fn fork_reads_exact_source_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = Session::create_in_dir(dir.path()).unwrap();
    source.append_message(user("one")).unwrap();
    let at = source.append_message(assistant("two")).unwrap();
    source.append_message(user("three")).unwrap();

    let fork_path = dir.path().join("forked.jsonl");
    let fork = source.fork(&at, &fork_path).unwrap();
    drop(fork);

    // Reload both from disk and compare the fork's branch to the source
    // prefix, byte for byte.
    let source = Session::open(&source.path.clone().unwrap()).unwrap();
    let fork = Session::open(&fork_path).unwrap();

    let source_prefix: Vec<String> = source
        .path_to(&at)
        .iter()
        .map(|id| entry_json(source.get_entry(id).unwrap()))
        .collect();
    let fork_branch: Vec<String> = fork.branch().iter().map(|e| entry_json(e)).collect();
    assert_eq!(source_prefix, fork_branch);

    // Source branch is untouched, still three entries long.
    assert_eq!(source.branch().len(), 3);
}

#[test]
fn compaction_shortens_materialization_and_keeps_terminal_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::create_in_dir(dir.path()).unwrap();
    session.append_message(user("old question")).unwrap();
    session.append_message(assistant("old answer")).unwrap();
    let kept = session.append_message(user("new question")).unwrap();
    session.append_message(assistant("new answer")).unwrap();

    let before = session.materialize();
    let before_tail: Vec<String> = before
        .iter()
        .skip(2)
        .map(|m| serde_json::to_string(m).unwrap())
        .collect();

    session
        .append_compaction("what came before".to_string(), kept, 5_000, 500)
        .unwrap();

    let after = session.materialize();
    assert!(after.len() < before.len() + 1);
    assert!(after.len() < before.len());

    // Terminal entries are identical byte-for-byte.
    let after_tail: Vec<String> = after
        .iter()
        .skip(1)
        .map(|m| serde_json::to_string(m).unwrap())
        .collect();
    assert_eq!(before_tail, after_tail);

    // And the law survives a reload.
    let path = session.path.clone().unwrap();
    drop(session);
    let reloaded = Session::open(&path).unwrap();
    let reloaded_tail: Vec<String> = reloaded
        .materialize()
        .iter()
        .skip(1)
        .map(|m| serde_json::to_string(m).unwrap())
        .collect();
    assert_eq!(before_tail, reloaded_tail);
}

#[test]
fn branch_walk_terminates_from_every_leaf() {
    let mut session = Session::in_memory();
    let root = session.append_message(user("root")).unwrap();
    // Fan out several branches.
    for i in 0..5 {
        session.set_leaf(&root).unwrap();
        let mid = session.append_message(user(&format!("mid-{i}"))).unwrap();
        session.set_leaf(&mid).unwrap();
        session
            .append_message(assistant(&format!("leaf-{i}")))
            .unwrap();
    }

    for leaf in session.leaves() {
        let path = session.path_to(leaf);
        // Finite, acyclic, rooted.
        assert!(!path.is_empty());
        assert!(path.len() <= session.entries().len());
        assert_eq!(path.first().map(String::as_str), Some(root.as_str()));
        let unique: std::collections::HashSet<&String> = path.iter().collect();
        assert_eq!(unique.len(), path.len());
    }
}

#[test]
fn appends_are_visible_to_concurrent_readers() {
    // Readers materialize snapshots while a writer appends: the reader
    // never sees a torn state, only progressively longer branches.
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::create_in_dir(dir.path()).unwrap();
    let path = session.path.clone().unwrap();

    let mut last_len = 0;
    for i in 0..20 {
        session.append_message(user(&format!("m{i}"))).unwrap();
        let reader = Session::open(&path).unwrap();
        let len = reader.branch().len();
        assert!(len >= last_len);
        last_len = len;
    }
    assert_eq!(last_len, 20);
}

#[test]
fn list_sessions_orders_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Session::create_in_dir(dir.path()).unwrap();
    first.append_message(user("first")).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut second = Session::create_in_dir(dir.path()).unwrap();
    second.append_message(user("second")).unwrap();
    second.set_name(Some("newest".to_string())).unwrap();

    let listed = list_sessions(dir.path()).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name.as_deref(), Some("newest"));
    assert!(listed[0].modified_ms >= listed[1].modified_ms);
}
