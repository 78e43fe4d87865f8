//! Unit tests for the prompt-directory and in-memory queue stores.

use std::fs;
use std::path::Path;

use agent_conductor::models::work_unit::{WorkStatus, WorkUnit};
use agent_conductor::persistence::queue_store::{
    split_front_matter, MemoryQueueStore, PromptDirStore, WorkQueueStore,
};
use agent_conductor::AppError;

fn write_prompt(dir: &Path, file: &str, content: &str) {
    fs::write(dir.join(file), content).expect("write prompt");
}

#[test]
fn splits_front_matter_from_body() {
    let raw = "+++\nid = 1\n+++\nDo the thing.\n";
    let (header, body) = split_front_matter(raw).expect("front matter");

    assert_eq!(header, "id = 1\n");
    assert_eq!(body, "Do the thing.\n");
}

#[test]
fn splits_crlf_front_matter() {
    let raw = "+++\r\nid = 2\r\n+++\r\nBody\r\n";
    let (header, body) = split_front_matter(raw).expect("front matter");

    assert_eq!(header, "id = 2\r\n");
    assert_eq!(body, "Body\r\n");
}

#[test]
fn missing_fences_yield_none() {
    assert!(split_front_matter("just a prompt").is_none());
    assert!(split_front_matter("+++\nid = 1\nno closing fence").is_none());
}

#[test]
fn loads_units_sorted_by_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(temp.path(), "b.md", "+++\nid = 2\ntitle = \"Second\"\n+++\nbody\n");
    write_prompt(temp.path(), "a.md", "+++\nid = 10\nstatus = \"done\"\n+++\nbody\n");
    write_prompt(
        temp.path(),
        "c.md",
        "+++\nid = 1\nstatus = \"running\"\nretry_count = 2\n+++\nbody\n",
    );
    let store = PromptDirStore::new(temp.path());

    let units = store.load_work_units().expect("load");

    let ids: Vec<u32> = units.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![1, 2, 10]);
    assert_eq!(units[0].status, WorkStatus::Running);
    assert_eq!(units[0].retry_count, 2);
    assert_eq!(units[1].status, WorkStatus::Queued);
    assert_eq!(units[1].title.as_deref(), Some("Second"));
    assert_eq!(units[2].status, WorkStatus::Done);
    assert_eq!(units[1].path.as_deref(), Some(temp.path().join("b.md").as_path()));
}

#[test]
fn id_falls_back_to_file_name_digits() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(temp.path(), "007-wire-loop.md", "+++\ntitle = \"Wire loop\"\n+++\nbody\n");
    let store = PromptDirStore::new(temp.path());

    let units = store.load_work_units().expect("load");

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].id, 7);
}

#[test]
fn invalid_files_are_skipped() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(temp.path(), "001-good.md", "+++\nstatus = \"queued\"\n+++\nbody\n");
    write_prompt(temp.path(), "002-no-front-matter.md", "plain prompt\n");
    write_prompt(temp.path(), "003-bad-status.md", "+++\nstatus = \"paused\"\n+++\n");
    write_prompt(temp.path(), "notes.md", "+++\ntitle = \"no id\"\n+++\n");
    write_prompt(temp.path(), "004-ignored.txt", "+++\nid = 4\n+++\n");
    let store = PromptDirStore::new(temp.path());

    let units = store.load_work_units().expect("load");

    let ids: Vec<u32> = units.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![1]);
}

#[test]
fn missing_directory_is_an_empty_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = PromptDirStore::new(temp.path().join("does-not-exist"));

    assert!(store.load_work_units().expect("load").is_empty());
}

#[test]
fn mark_status_rewrites_header_and_keeps_body() {
    let temp = tempfile::tempdir().expect("tempdir");
    let body = "Implement the reconciler.\n\n+++ not a fence +++\n";
    write_prompt(
        temp.path(),
        "001-reconciler.md",
        &format!("+++\nid = 1\nowner = \"alice\"\n+++\n{body}"),
    );
    let store = PromptDirStore::new(temp.path());

    store.mark_status(1, WorkStatus::Dispatched).expect("mark");

    let raw = fs::read_to_string(temp.path().join("001-reconciler.md")).expect("read back");
    let (header, rest) = split_front_matter(&raw).expect("front matter kept");
    assert_eq!(rest, body);

    let table: toml::Table = toml::from_str(header).expect("header is toml");
    assert_eq!(table["status"].as_str(), Some("dispatched"));
    assert_eq!(table["owner"].as_str(), Some("alice"));
    let stamp = table["updated_at"].as_str().expect("updated_at stamped");
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

    let units = store.load_work_units().expect("load");
    assert_eq!(units[0].status, WorkStatus::Dispatched);
}

#[test]
fn requeue_writes_status_and_counter_together() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(
        temp.path(),
        "003.md",
        "+++\nstatus = \"running\"\nretry_count = 1\nowner = \"ops\"\n+++\nbody\n",
    );
    let store = PromptDirStore::new(temp.path());

    store.requeue(3, 2).expect("requeue");

    let units = store.load_work_units().expect("load");
    assert_eq!(units[0].retry_count, 2);
    assert_eq!(units[0].status, WorkStatus::Queued);

    let raw = fs::read_to_string(temp.path().join("003.md")).expect("read back");
    let (header, body) = split_front_matter(&raw).expect("front matter");
    let table: toml::Table = toml::from_str(header).expect("toml");
    assert_eq!(table["status"].as_str(), Some("queued"));
    assert_eq!(table["retry_count"].as_integer(), Some(2));
    assert_eq!(table["owner"].as_str(), Some("ops"));
    assert!(table.contains_key("updated_at"));
    assert_eq!(body, "body\n");

    // Only the prompt file itself is left behind; no stray temp files.
    let entries = fs::read_dir(temp.path()).expect("read dir").count();
    assert_eq!(entries, 1);
}

#[test]
fn requeue_of_unknown_unit_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(temp.path(), "001.md", "+++\nstatus = \"running\"\n+++\n");
    let store = PromptDirStore::new(temp.path());

    assert!(matches!(store.requeue(7, 1), Err(AppError::NotFound(_))));
    assert_eq!(store.load_work_units().expect("load")[0].status, WorkStatus::Running);
}

#[test]
fn updating_unknown_unit_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_prompt(temp.path(), "001.md", "+++\n+++\n");
    let store = PromptDirStore::new(temp.path());

    let err = store
        .mark_status(99, WorkStatus::Done)
        .expect_err("unknown id");
    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("99")));
}

#[test]
fn memory_store_loads_sorted_and_updates() {
    let store = MemoryQueueStore::new(vec![WorkUnit::queued(3), WorkUnit::queued(1)]);
    store.push(WorkUnit::queued(2)).expect("push");

    let ids: Vec<u32> = store
        .load_work_units()
        .expect("load")
        .iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    store.mark_status(2, WorkStatus::Blocked).expect("mark");
    store.requeue(2, 3).expect("requeue");
    let unit = store
        .units()
        .expect("units")
        .into_iter()
        .find(|u| u.id == 2)
        .expect("unit 2");
    assert_eq!(unit.status, WorkStatus::Queued);
    assert_eq!(unit.retry_count, 3);

    assert!(matches!(
        store.mark_status(42, WorkStatus::Done),
        Err(AppError::NotFound(_))
    ));
}
