//! Embedded schema, applied with `CREATE TABLE IF NOT EXISTS` at
//! `connect()` time. A single fixed schema, no versioned migrations,
//! mirroring the "no migration across schema versions" non-goal.

pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS instance (
    id                  TEXT PRIMARY KEY,
    instance_type       TEXT NOT NULL,
    status              TEXT NOT NULL,
    worktree_path       TEXT NOT NULL DEFAULT '',
    branch_name         TEXT NOT NULL DEFAULT '',
    tmux_session        TEXT NOT NULL DEFAULT '',
    issue_number        INTEGER,
    parent_instance_id  TEXT,
    base_branch         TEXT NOT NULL DEFAULT '',
    agent_number        INTEGER,
    system_prompt       TEXT NOT NULL DEFAULT '',
    prompt_used         TEXT NOT NULL DEFAULT '',
    prompt_context      TEXT NOT NULL DEFAULT '',
    claude_pid          INTEGER,
    created_at          TEXT NOT NULL,
    last_activity       TEXT NOT NULL,
    terminated_at       TEXT
);

CREATE TABLE IF NOT EXISTS event (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id         TEXT NOT NULL REFERENCES instance(id),
    tool_name           TEXT NOT NULL,
    timestamp           TEXT NOT NULL,
    success             INTEGER NOT NULL,
    error_message       TEXT,
    is_status_updating  INTEGER NOT NULL DEFAULT 0,
    status_change       TEXT,
    parameters          TEXT,
    result              TEXT
);

CREATE INDEX IF NOT EXISTS idx_event_instance_id ON event(instance_id);
CREATE INDEX IF NOT EXISTS idx_event_timestamp ON event(timestamp);

CREATE TABLE IF NOT EXISTS relationship (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_instance     TEXT NOT NULL REFERENCES instance(id),
    child_instance      TEXT NOT NULL REFERENCES instance(id),
    relationship_type   TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    review_iteration    INTEGER NOT NULL DEFAULT 0,
    UNIQUE(parent_instance, child_instance, relationship_type)
);

CREATE INDEX IF NOT EXISTS idx_relationship_parent ON relationship(parent_instance);
CREATE INDEX IF NOT EXISTS idx_relationship_child ON relationship(child_instance);

CREATE TABLE IF NOT EXISTS github_issue (
    number              INTEGER PRIMARY KEY,
    title               TEXT NOT NULL,
    body                TEXT NOT NULL DEFAULT '',
    state               TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_config (
    key                 TEXT PRIMARY KEY,
    value               TEXT NOT NULL,
    encrypted           INTEGER NOT NULL DEFAULT 0
);
";
