use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Column order used by an `INSERT INTO reservations` without a column list.
const INSERT_COLUMNS: [&str; 6] = ["room_id", "title", "description", "start_time", "end_time", "invitees"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        room_id: RoomId,
        data: NewReservation,
    },
    UpdateReservation {
        id: ReservationId,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: ReservationId,
    },
    SelectReservations {
        room_id: RoomId,
    },
    SelectReservation {
        id: ReservationId,
    },
    SelectAvailability {
        room_id: RoomId,
        start: Option<String>,
        end: Option<String>,
        min_duration: Option<Ms>,
    },
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing value for {0}")]
    MissingColumn(&'static str),
    #[error("{0} cannot be NULL")]
    NotNull(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }

    let mut room_id = None;
    let mut data = NewReservation::default();
    let (mut title, mut start, mut end) = (None, None, None);
    for (column, value) in columns.iter().zip(values) {
        match column.as_str() {
            "room_id" => room_id = Some(parse_ulid_expr(value)?),
            "title" => title = parse_text_or_null(value)?,
            "description" => data.description = parse_text_or_null(value)?,
            "start_time" => start = parse_text_or_null(value)?,
            "end_time" => end = parse_text_or_null(value)?,
            "invitees" => data.invitees = parse_ulid_list(value)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    data.title = title.ok_or(SqlError::MissingColumn("title"))?;
    data.start_time = start.ok_or(SqlError::MissingColumn("start_time"))?;
    data.end_time = end.ok_or(SqlError::MissingColumn("end_time"))?;

    Ok(Command::InsertReservation {
        room_id: room_id.ok_or(SqlError::MissingColumn("room_id"))?,
        data,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut patch = ReservationPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match column.as_str() {
            "title" => patch.title = Patch::Set(parse_text_or_null(value)?.ok_or(SqlError::NotNull("title"))?),
            "description" => patch.description = Patch::Set(parse_text_or_null(value)?),
            "start_time" => {
                patch.start_time = Patch::Set(parse_text_or_null(value)?.ok_or(SqlError::NotNull("start_time"))?)
            }
            "end_time" => {
                patch.end_time = Patch::Set(parse_text_or_null(value)?.ok_or(SqlError::NotNull("end_time"))?)
            }
            "invitees" => patch.invitees = Patch::Set(parse_ulid_list(value)?),
            "id" | "room_id" | "organizer_id" | "created_at" | "updated_at" => {
                return Err(SqlError::Unsupported(format!("{column} cannot be updated")));
            }
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    let id = extract_where_id(selection)?;
    Ok(Command::UpdateReservation { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(delete.selection.as_ref())?;
    Ok(Command::DeleteReservation { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let find = |column: &str, op: BinaryOperator| {
        filters
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    };

    match table.as_str() {
        "reservations" => {
            if let Some(id) = find("id", BinaryOperator::Eq) {
                return Ok(Command::SelectReservation { id: parse_ulid_expr(id)? });
            }
            let room_id = find("room_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("room_id"))?;
            Ok(Command::SelectReservations {
                room_id: parse_ulid_expr(room_id)?,
            })
        }
        "availability" => {
            let room_id = find("room_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("room_id"))?;
            Ok(Command::SelectAvailability {
                room_id: parse_ulid_expr(room_id)?,
                start: find("start", BinaryOperator::GtEq).map(parse_text_or_null).transpose()?.flatten(),
                end: find("end", BinaryOperator::LtEq).map(parse_text_or_null).transpose()?.flatten(),
                min_duration: find("min_duration", BinaryOperator::Eq).map(parse_i64_expr).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND tree of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables.first().ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let source = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => parse_ulid_str(&s),
        None => Err(SqlError::Parse("expected ULID, got NULL".into())),
    }
}

/// `ARRAY['id', ...]`, a comma-separated string (optionally in `{}` as
/// the text form of a Postgres array), or NULL for an empty list.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid_expr).collect();
    }
    let Some(text) = parse_text_or_null(expr)? else {
        return Ok(Vec::new());
    };
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_ulid_str)
        .collect()
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match parse_text_or_null(expr)? {
        Some(s) => s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        None => Err(SqlError::Parse("expected integer, got NULL".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RES: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const U1: &str = "01HZY0000000000000000000A1";
    const U2: &str = "01HZY0000000000000000000A2";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (room_id, title, start_time, end_time) \
             VALUES ('{ROOM}', 'Standup', '2030-01-15T09:00:00Z', '2030-01-15T09:30:00Z')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { room_id, data } => {
                assert_eq!(room_id, ulid(ROOM));
                assert_eq!(data.title, "Standup");
                assert_eq!(data.description, None);
                assert_eq!(data.start_time, "2030-01-15T09:00:00Z");
                assert_eq!(data.end_time, "2030-01-15T09:30:00Z");
                assert!(data.invitees.is_empty());
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_columns_matched_by_name() {
        let sql = format!(
            "INSERT INTO reservations (end_time, invitees, title, room_id, start_time, description) \
             VALUES ('2030-01-15T10:00:00Z', ARRAY['{U1}', '{U2}'], 'Plan', '{ROOM}', '2030-01-15T09:00:00Z', 'Q3')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { data, .. } => {
                assert_eq!(data.title, "Plan");
                assert_eq!(data.description.as_deref(), Some("Q3"));
                assert_eq!(data.start_time, "2030-01-15T09:00:00Z");
                assert_eq!(data.invitees, vec![ulid(U1), ulid(U2)]);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_invitees_as_text() {
        let sql = format!(
            "INSERT INTO reservations VALUES ('{ROOM}', 'Plan', NULL, '2030-01-15T09:00:00Z', '2030-01-15T10:00:00Z', '{{{U1}, {U2}}}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { data, .. } => assert_eq!(data.invitees, vec![ulid(U1), ulid(U2)]),
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_requires_title_and_times() {
        let sql = format!("INSERT INTO reservations (room_id, title) VALUES ('{ROOM}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("start_time"))));
    }

    #[test]
    fn parse_update_partial() {
        let sql = format!("UPDATE reservations SET title = 'Retro', description = NULL WHERE id = '{RES}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservation { id, patch } => {
                assert_eq!(id, ulid(RES));
                assert_eq!(patch.title, Patch::Set("Retro".into()));
                assert_eq!(patch.description, Patch::Set(None));
                assert_eq!(patch.start_time, Patch::Unchanged);
                assert_eq!(patch.invitees, Patch::Unchanged);
            }
            cmd => panic!("expected UpdateReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn update_empty_array_clears_invitees() {
        let sql = format!("UPDATE reservations SET invitees = ARRAY[], end_time = '2030-01-15T11:00:00Z' WHERE id = '{RES}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservation { patch, .. } => {
                assert_eq!(patch.invitees, Patch::Set(vec![]));
                assert_eq!(patch.end_time, Patch::Set("2030-01-15T11:00:00Z".into()));
                assert!(patch.touches_window());
            }
            cmd => panic!("expected UpdateReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn update_rejects_null_title_and_room_change() {
        let sql = format!("UPDATE reservations SET title = NULL WHERE id = '{RES}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::NotNull("title"))));
        let sql = format!("UPDATE reservations SET room_id = '{ROOM}' WHERE id = '{RES}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_requires_id_filter() {
        let sql = format!("UPDATE reservations SET title = 'x' WHERE room_id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_reservation() {
        let sql = format!("DELETE FROM reservations WHERE id = '{RES}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteReservation { id: ulid(RES) });
    }

    #[test]
    fn parse_select_reservations() {
        let sql = format!("SELECT * FROM reservations WHERE room_id = '{ROOM}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectReservations { room_id: ulid(ROOM) });
        let sql = format!("SELECT * FROM reservations WHERE id = '{RES}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectReservation { id: ulid(RES) });
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE room_id = '{ROOM}' AND start >= '2030-01-15' \
             AND \"end\" <= '2030-01-16T18:00:00Z' AND min_duration = 1800000"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                room_id: ulid(ROOM),
                start: Some("2030-01-15".into()),
                end: Some("2030-01-16T18:00:00Z".into()),
                min_duration: Some(1_800_000),
            }
        );
    }

    #[test]
    fn availability_bounds_are_optional() {
        let sql = format!("SELECT * FROM availability WHERE room_id = '{ROOM}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                room_id: ulid(ROOM),
                start: None,
                end: None,
                min_duration: None,
            }
        );
    }

    #[test]
    fn availability_requires_room() {
        let sql = "SELECT * FROM availability WHERE start >= '2030-01-15'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("room_id"))));
    }

    #[test]
    fn unknown_table_errors() {
        let sql = format!("DELETE FROM rooms WHERE id = '{ROOM}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "rooms"));
    }

    #[test]
    fn bad_ulid_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM reservations WHERE id = 'nope'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
