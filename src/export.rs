//! Beads JSONL export (`SPEC_FULL.md` §6): one JSON object per line,
//! epics first, then tasks, status remapped to beads' three-value scheme.

use std::io::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::model::{Epic, EpicStatus, Task, TaskStatus};
use crate::store::TaskStore;

#[derive(Serialize)]
struct EpicData<'a> {
    title: &'a str,
    description: &'a str,
    status: &'static str,
}

#[derive(Serialize)]
struct BeadData<'a> {
    title: &'a str,
    description: &'a str,
    status: &'static str,
    priority: i64,
    epic_id: Option<&'a str>,
}

/// Beads JSONL record shape (`spec.md` §6): record-kind fields live at the
/// top level, the record's own payload nests under `data`.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Epic {
        id: &'a str,
        timestamp: i64,
        data: EpicData<'a>,
    },
    Bead {
        id: &'a str,
        timestamp: i64,
        data: BeadData<'a>,
    },
}

/// Maps internal [`TaskStatus`] onto beads' `{open, active, closed}`
/// vocabulary (`spec.md` §6 status mapping table).
#[must_use]
pub fn bead_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Ready | TaskStatus::Claimed | TaskStatus::Blocked | TaskStatus::Paused => "open",
        TaskStatus::InProgress => "active",
        TaskStatus::Completed | TaskStatus::Failed => "closed",
    }
}

fn epic_record(epic: &Epic) -> Record<'_> {
    Record::Epic {
        id: epic.id.as_str(),
        timestamp: epic.created_at,
        data: EpicData {
            title: &epic.title,
            description: &epic.description,
            status: match epic.status {
                EpicStatus::Open => "open",
                EpicStatus::Closed => "closed",
            },
        },
    }
}

fn bead_record(task: &Task) -> Record<'_> {
    Record::Bead {
        id: task.id.as_str(),
        timestamp: task.updated_at,
        data: BeadData {
            title: &task.title,
            description: &task.description,
            status: bead_status(task.status),
            priority: task.priority,
            epic_id: task.epic_id.as_ref().map(crate::model::EpicId::as_str),
        },
    }
}

/// Write every epic and task in `store` as beads JSONL to `path`.
pub fn write_jsonl(store: &TaskStore, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    write_records(store, &mut writer)
}

fn write_records(store: &TaskStore, writer: &mut impl std::io::Write) -> Result<()> {
    for epic in store.list_epics()? {
        writeln!(writer, "{}", serde_json::to_string(&epic_record(&epic))?)?;
    }
    for task in store.list_tasks(None)? {
        writeln!(writer, "{}", serde_json::to_string(&bead_record(&task))?)?;
    }
    Ok(())
}

impl From<serde_json::Error> for crate::error::DroverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal {
            detail: format!("json serialization failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EpicId, TaskId};
    use crate::store::NewTask;

    #[test]
    fn status_mapping_matches_beads_vocabulary() {
        assert_eq!(bead_status(TaskStatus::Ready), "open");
        assert_eq!(bead_status(TaskStatus::Blocked), "open");
        assert_eq!(bead_status(TaskStatus::InProgress), "active");
        assert_eq!(bead_status(TaskStatus::Completed), "closed");
        assert_eq!(bead_status(TaskStatus::Failed), "closed");
    }

    #[test]
    fn write_jsonl_emits_epics_then_tasks() {
        let store = TaskStore::open_in_memory().unwrap();
        store.create_epic(&EpicId::new("e1").unwrap(), "Epic One", "desc").unwrap();
        store
            .create_task(
                &TaskId::new("t1").unwrap(),
                &NewTask {
                    epic_id: Some(EpicId::new("e1").unwrap()),
                    title: "Task One".to_owned(),
                    ..Default::default()
                },
            )
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.jsonl");
        write_jsonl(&store, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"epic\""));
        assert!(lines[0].contains("\"timestamp\""));
        assert!(lines[0].contains("\"data\":{"));
        assert!(lines[1].contains("\"type\":\"bead\""));
        assert!(lines[1].contains("\"status\":\"open\""));
    }
}
