//! SQL schema for the task store. Owned entirely by this crate — no
//! external migration tool, since the schema is small (`SPEC_FULL.md` §4.1).

pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS epics (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    description TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    epic_id         TEXT REFERENCES epics(id),
    parent_id       TEXT REFERENCES tasks(id),
    priority        INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,
    last_error      TEXT,
    claimer         TEXT,
    claimed_at      INTEGER,
    workspace_id    TEXT,
    verdict         TEXT,
    verdict_reason  TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_blockers (
    task_id    TEXT NOT NULL REFERENCES tasks(id),
    blocker_id TEXT NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, blocker_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim_candidate
    ON tasks (status, parent_id, priority DESC, created_at ASC);

CREATE INDEX IF NOT EXISTS idx_task_blockers_blocker
    ON task_blockers (blocker_id);
";
