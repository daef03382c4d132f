//! Postgres schema for the task table and its change notifications.
//!
//! Change tracking is a row trigger that `pg_notify`s on the configured
//! channel once the writing transaction commits. The notification carries
//! the row image as it was at the time of the change, already in change
//! batch form:
//!
//! ```text
//! [{"operation":"insert","item":{"id":7,"payload":"...","processed":false,...}}]
//! ```
//!
//! NOTIFY payloads are capped at 8000 bytes. A row whose image does not fit
//! is announced by reference instead (`{"operation":"insert","id":7}`) and
//! the listener reads it back.

/// Name of the trigger function installed by `statements()`.
pub const NOTIFY_FUNCTION: &str = "taskrelay_notify_task_change";

/// Default LISTEN/NOTIFY channel.
pub const DEFAULT_CHANNEL: &str = "task_changes";

/// Largest notification body, in bytes, the trigger will send inline.
pub const MAX_INLINE_NOTIFICATION: usize = 7900;

const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id             BIGSERIAL PRIMARY KEY,
    payload        TEXT NOT NULL CHECK (payload <> ''),
    processed      BOOLEAN NOT NULL DEFAULT FALSE,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    submission_id  UUID UNIQUE
)
"#;

// Tables created before submissions were keyed.
const ADD_SUBMISSION_ID: &str =
    "ALTER TABLE tasks ADD COLUMN IF NOT EXISTS submission_id UUID UNIQUE";

const DROP_TRIGGER: &str = "DROP TRIGGER IF EXISTS tasks_notify_change ON tasks";

/// Is `channel` usable as an unquoted Postgres identifier?
pub fn is_valid_channel(channel: &str) -> bool {
    let mut chars = channel.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    channel.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// DDL statements, in execution order. Each entry is a single statement.
///
/// `channel` must pass `is_valid_channel`; it is spliced into the function body.
pub fn statements(channel: &str) -> Vec<String> {
    let notify_fn = format!(
        r#"
CREATE OR REPLACE FUNCTION {NOTIFY_FUNCTION}() RETURNS trigger AS $$
DECLARE
    body text;
BEGIN
    body := json_build_array(
        json_build_object('operation', lower(TG_OP), 'item', row_to_json(NEW))
    )::text;
    IF octet_length(body) > {MAX_INLINE_NOTIFICATION} THEN
        body := json_build_object('operation', lower(TG_OP), 'id', NEW.id)::text;
    END IF;
    PERFORM pg_notify('{channel}', body);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#
    );

    let create_trigger = format!(
        "CREATE TRIGGER tasks_notify_change AFTER INSERT OR UPDATE ON tasks \
         FOR EACH ROW EXECUTE FUNCTION {NOTIFY_FUNCTION}()"
    );

    vec![
        CREATE_TASKS.to_string(),
        ADD_SUBMISSION_ID.to_string(),
        notify_fn,
        DROP_TRIGGER.to_string(),
        create_trigger,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_must_be_plain_identifiers() {
        assert!(is_valid_channel("task_changes"));
        assert!(is_valid_channel("_c1"));
        assert!(!is_valid_channel(""));
        assert!(!is_valid_channel("1abc"));
        assert!(!is_valid_channel("Tasks"));
        assert!(!is_valid_channel("x'; DROP TABLE tasks; --"));
        assert!(!is_valid_channel(&"a".repeat(64)));
    }

    #[test]
    fn statements_wire_the_channel_into_the_trigger_function() {
        let stmts = statements("my_feed");
        assert_eq!(stmts.len(), 5);
        assert!(stmts[0].contains("CREATE TABLE IF NOT EXISTS tasks"));
        assert!(stmts[0].contains("submission_id  UUID UNIQUE"));
        assert!(stmts[1].contains("ADD COLUMN IF NOT EXISTS submission_id"));
        assert!(stmts[2].contains("pg_notify('my_feed'"));
        assert!(stmts[4].contains(NOTIFY_FUNCTION));
    }

    #[test]
    fn trigger_sends_the_row_image_and_falls_back_to_a_reference() {
        let body = &statements(DEFAULT_CHANNEL)[2];
        assert!(body.contains("row_to_json(NEW)"));
        assert!(body.contains("octet_length(body) > 7900"));
        assert!(body.contains("'id', NEW.id"));
    }
}
