//! Execute-SQL adapter: the narrow seam through which the router and
//! agent reach the relational backends, plus the statement builders
//! both of them share.

use crate::api::{Segment, WriteOp};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("failed to run mysql client: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("mysql exec failed: {0}")]
    Exec(String),
    #[error("unsupported value for column {0}")]
    BadValue(String),
    #[error("write for table {0} carries no columns")]
    EmptyWrite(String),
}

#[derive(Debug, Clone)]
pub struct SqlEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, endpoint: &SqlEndpoint, statement: &str) -> Result<(), SqlError>;
}

/// Shells out to the `mysql` CLI. Non-zero exit surfaces the combined
/// output as the error message.
pub struct MysqlExecutor;

#[async_trait]
impl SqlExecutor for MysqlExecutor {
    async fn execute(&self, endpoint: &SqlEndpoint, statement: &str) -> Result<(), SqlError> {
        let mut cmd = Command::new("mysql");
        cmd.arg("-h")
            .arg(&endpoint.host)
            .arg("-P")
            .arg(endpoint.port.to_string())
            .arg("-u")
            .arg(&endpoint.user);
        if !endpoint.password.is_empty() {
            cmd.arg(format!("-p{}", endpoint.password));
        }
        if !endpoint.database.is_empty() {
            cmd.arg(&endpoint.database);
        }
        cmd.arg("-e").arg(statement);
        let output = cmd.output().await?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{} {}", stdout.trim(), stderr.trim());
            return Err(SqlError::Exec(combined.trim().to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Owner,
    Replica,
}

impl NodeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeMode::Owner => "OWNER",
            NodeMode::Replica => "REPLICA",
        }
    }
}

/// Renders a write as a single statement. `idempotent` selects the
/// agent-side insert form whose re-application is a row-level no-op.
pub fn write_statement(op: &WriteOp, idempotent: bool) -> Result<String, SqlError> {
    match op {
        WriteOp::Insert { table, id, data } => {
            if data.is_empty() {
                return Err(SqlError::EmptyWrite(table.clone()));
            }
            let columns: Vec<&str> = data.keys().map(String::as_str).collect();
            let mut values = Vec::with_capacity(columns.len());
            for (column, value) in data {
                values.push(render_value(column, value)?);
            }
            let mut stmt = format!(
                "INSERT INTO {} (id, {}, updated_at) VALUES ({id}, {}, NOW())",
                quote_identifier(table),
                columns.join(", "),
                values.join(", "),
            );
            if idempotent {
                let updates: Vec<String> = columns
                    .iter()
                    .map(|column| format!("{column}=VALUES({column})"))
                    .chain(std::iter::once("updated_at=VALUES(updated_at)".to_string()))
                    .collect();
                stmt.push_str(" ON DUPLICATE KEY UPDATE ");
                stmt.push_str(&updates.join(", "));
            }
            Ok(stmt)
        }
        WriteOp::Update { table, id, data } => {
            if data.is_empty() {
                return Err(SqlError::EmptyWrite(table.clone()));
            }
            let mut assignments = Vec::with_capacity(data.len() + 1);
            for (column, value) in data {
                assignments.push(format!("{column}={}", render_value(column, value)?));
            }
            assignments.push("updated_at=NOW()".to_string());
            Ok(format!(
                "UPDATE {} SET {} WHERE id={id}",
                quote_identifier(table),
                assignments.join(", "),
            ))
        }
        WriteOp::Delete { table, id } => Ok(format!(
            "DELETE FROM {} WHERE id={id}",
            quote_identifier(table)
        )),
    }
}

/// Applied-set bookkeeping row, keyed `(range_id, txn_id)` so that a
/// re-delivered segment upserts instead of duplicating.
pub fn applied_segment_upsert(seg: &Segment) -> String {
    format!(
        "INSERT INTO rlr_meta.applied_segments (range_id, epoch, txn_id, commit_index, applied_at) \
         VALUES ('{}', {}, '{}', {}, NOW()) \
         ON DUPLICATE KEY UPDATE commit_index=VALUES(commit_index), applied_at=VALUES(applied_at)",
        escape_string(&seg.range_id),
        seg.epoch,
        escape_string(&seg.txn_id),
        seg.commit_index,
    )
}

/// Privileged mode-flag settings pushed to every backend on lease admin.
pub fn mode_statement(node_id: &str, mode: NodeMode) -> String {
    format!(
        "SET GLOBAL fenceline.mode='{}'; SET GLOBAL fenceline.node_id='{}';",
        mode.as_str(),
        escape_string(node_id),
    )
}

/// Wraps statements in one `BEGIN/…/COMMIT` block.
pub fn transaction(statements: &[String]) -> String {
    let mut out = String::from("BEGIN; ");
    for stmt in statements {
        out.push_str(stmt);
        out.push_str("; ");
    }
    out.push_str("COMMIT;");
    out
}

pub fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), 3306),
        },
        None => (addr.to_string(), 3306),
    }
}

fn render_value(column: &str, value: &Value) -> Result<String, SqlError> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) => Ok("0".to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::String(text) => Ok(format!("'{}'", escape_string(text))),
        Value::Array(_) | Value::Object(_) => Err(SqlError::BadValue(column.to_string())),
    }
}

fn escape_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quote_identifier(raw: &str) -> String {
    format!("`{}`", raw.replace('`', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::payload_checksum;
    use serde_json::json;

    fn data(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn insert_renders_plain_and_idempotent_forms() {
        let op = WriteOp::Insert {
            table: "accounts".to_string(),
            id: 7,
            data: data(json!({"balance": 100})),
        };
        assert_eq!(
            write_statement(&op, false).expect("render"),
            "INSERT INTO `accounts` (id, balance, updated_at) VALUES (7, 100, NOW())"
        );
        assert_eq!(
            write_statement(&op, true).expect("render"),
            "INSERT INTO `accounts` (id, balance, updated_at) VALUES (7, 100, NOW()) \
             ON DUPLICATE KEY UPDATE balance=VALUES(balance), updated_at=VALUES(updated_at)"
        );
    }

    #[test]
    fn update_and_delete_render() {
        let update = WriteOp::Update {
            table: "accounts".to_string(),
            id: 7,
            data: data(json!({"balance": 200})),
        };
        assert_eq!(
            write_statement(&update, true).expect("render"),
            "UPDATE `accounts` SET balance=200, updated_at=NOW() WHERE id=7"
        );
        let delete = WriteOp::Delete {
            table: "accounts".to_string(),
            id: 7,
        };
        assert_eq!(
            write_statement(&delete, true).expect("render"),
            "DELETE FROM `accounts` WHERE id=7"
        );
    }

    #[test]
    fn string_values_are_escaped() {
        let op = WriteOp::Update {
            table: "accounts".to_string(),
            id: 1,
            data: data(json!({"note": "it's 50\\50"})),
        };
        let stmt = write_statement(&op, false).expect("render");
        assert!(stmt.contains("note='it\\'s 50\\\\50'"));
    }

    #[test]
    fn nested_values_are_rejected() {
        let op = WriteOp::Insert {
            table: "accounts".to_string(),
            id: 1,
            data: data(json!({"tags": ["a", "b"]})),
        };
        assert!(matches!(
            write_statement(&op, false),
            Err(SqlError::BadValue(column)) if column == "tags"
        ));
    }

    #[test]
    fn empty_writes_are_rejected() {
        let op = WriteOp::Update {
            table: "accounts".to_string(),
            id: 1,
            data: serde_json::Map::new(),
        };
        assert!(matches!(
            write_statement(&op, false),
            Err(SqlError::EmptyWrite(_))
        ));
    }

    #[test]
    fn applied_upsert_carries_the_segment_key() {
        let payload = b"{}".to_vec();
        let seg = Segment {
            range_id: "R".to_string(),
            epoch: 9,
            txn_id: "T1".to_string(),
            commit_index: 6,
            payload_type: "json".to_string(),
            checksum: payload_checksum(&payload),
            payload_bytes: payload,
        };
        let stmt = applied_segment_upsert(&seg);
        assert!(stmt.starts_with(
            "INSERT INTO rlr_meta.applied_segments (range_id, epoch, txn_id, commit_index, applied_at)"
        ));
        assert!(stmt.contains("VALUES ('R', 9, 'T1', 6, NOW())"));
        assert!(stmt.contains("ON DUPLICATE KEY UPDATE commit_index=VALUES(commit_index)"));
    }

    #[test]
    fn mode_statement_targets_the_node() {
        let stmt = mode_statement("mysql1", NodeMode::Owner);
        assert_eq!(
            stmt,
            "SET GLOBAL fenceline.mode='OWNER'; SET GLOBAL fenceline.node_id='mysql1';"
        );
    }

    #[test]
    fn transaction_wraps_statements() {
        let stmt = transaction(&["UPDATE `t` SET a=1 WHERE id=2".to_string()]);
        assert_eq!(stmt, "BEGIN; UPDATE `t` SET a=1 WHERE id=2; COMMIT;");
    }

    #[test]
    fn host_port_split_defaults_to_mysql_port() {
        assert_eq!(split_host_port("db1:3307"), ("db1".to_string(), 3307));
        assert_eq!(split_host_port("db1"), ("db1".to_string(), 3306));
    }
}
