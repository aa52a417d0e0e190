use crate::value::FedValue;

/// Quoting helpers (spec §4.E): identifiers are backtick-quoted with
/// embedded backticks doubled; string literal quoting lives on `FedValue`
/// itself (`to_sql_literal`).
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// One key-range endpoint flag (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFlag {
    Exact,
    After,
    OrNext,
    Before,
    OrPrev,
}

/// One column within a (possibly composite) key side.
#[derive(Debug, Clone)]
pub struct KeyPart {
    pub column: String,
    pub value: Option<FedValue>,
    pub is_null_part: bool,
    pub is_prefix: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KeySide {
    pub parts: Vec<KeyPart>,
    pub flag: Option<RangeFlag>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub start: Option<KeySide>,
    pub end: Option<KeySide>,
    pub from_records_in_range: bool,
}

fn render_side(side: &KeySide, from_records_in_range: bool, is_end_side: bool) -> Option<String> {
    let flag = side.flag?;
    let mut clauses = Vec::new();
    for part in &side.parts {
        let col = quote_identifier(&part.column);
        if part.is_null_part {
            clauses.push(if flag == RangeFlag::Exact {
                format!("{} IS NULL", col)
            } else {
                format!("{} IS NOT NULL", col)
            });
            continue;
        }
        let value = part.value.as_ref()?.to_sql_literal();
        let clause = match flag {
            RangeFlag::Exact => {
                if part.is_prefix {
                    if let Some(FedValue::Str(s)) = &part.value {
                        format!("{} LIKE '{}%'", col, s.replace('\'', "''"))
                    } else {
                        format!("{} = {}", col, value)
                    }
                } else if from_records_in_range {
                    format!("{} >= {}", col, value)
                } else {
                    format!("{} = {}", col, value)
                }
            }
            RangeFlag::After => {
                if is_end_side {
                    format!("{} <= {}", col, value)
                } else {
                    format!("{} > {}", col, value)
                }
            }
            RangeFlag::OrNext => format!("{} >= {}", col, value),
            RangeFlag::Before => format!("{} < {}", col, value),
            RangeFlag::OrPrev => format!("{} <= {}", col, value),
        };
        clauses.push(clause);
    }
    if clauses.is_empty() {
        // AFTER on a degenerate eq-range with no remaining parts.
        Some("1=1".to_string())
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Builds the `WHERE` clause body (without the `WHERE` keyword) for a key
/// range per spec §4.E, optionally ANDing an additional pushed-down filter.
pub fn where_from_key_range(range: &KeyRange, extra_filter: Option<&str>) -> Option<String> {
    let start_sql = range.start.as_ref().and_then(|s| render_side(s, range.from_records_in_range, false));
    let end_sql = range.end.as_ref().and_then(|s| render_side(s, range.from_records_in_range, true));

    let mut body = match (start_sql, end_sql) {
        (Some(s), Some(e)) => format!("({}) AND ({})", s, e),
        (Some(s), None) => format!("({})", s),
        (None, Some(e)) => format!("({})", e),
        (None, None) => return extra_filter.map(|f| format!("({})", f)),
    };
    if let Some(filter) = extra_filter {
        body.push_str(&format!(" AND ({})", filter));
    }
    Some(body)
}

/// Duplicate-key handling policy for INSERT (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPolicy {
    Plain,
    Ignore,
    Replace,
}

/// Accumulates `(vals)` tuples and flushes them into bulk `INSERT`
/// statements once the next tuple would overflow `max_query_size`, mirroring
/// the batching rule in spec §4.E. `split_sql_statements`-style scanning is
/// not needed for building statements (only for replaying a bulk buffer
/// against the remote one at a time), so this is a straightforward byte
/// budget tracker rather than a lexer.
pub struct BulkInsertBuilder {
    table: String,
    columns: Vec<String>,
    policy: InsertPolicy,
    max_query_size: usize,
    batch_cap: usize,
    prefix: String,
    buffer: String,
    pending_rows: usize,
    flushed: Vec<String>,
}

impl BulkInsertBuilder {
    pub fn new(table: &str, columns: &[String], policy: InsertPolicy, max_query_size: usize, batch_cap: usize) -> Self {
        let verb = match policy {
            InsertPolicy::Plain => "INSERT INTO",
            InsertPolicy::Ignore => "INSERT IGNORE INTO",
            InsertPolicy::Replace => "REPLACE INTO",
        };
        let col_list = if columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", "))
        };
        let prefix = format!("{} {}{} VALUES ", verb, quote_identifier(table), col_list);
        BulkInsertBuilder {
            table: table.to_string(),
            columns: columns.to_vec(),
            policy,
            max_query_size,
            batch_cap,
            prefix,
            buffer: String::new(),
            pending_rows: 0,
            flushed: Vec::new(),
        }
    }

    fn tuple_sql(values: &[FedValue]) -> String {
        if values.is_empty() {
            return "()".to_string();
        }
        format!("({})", values.iter().map(|v| v.to_sql_literal()).collect::<Vec<_>>().join(", "))
    }

    /// Adds one row's values to the pending batch, flushing first if the
    /// addition would overflow `max_query_size` or the configured batch cap.
    pub fn push_row(&mut self, values: &[FedValue]) {
        let tuple = Self::tuple_sql(values);
        let would_be_len = self.prefix.len() + self.buffer.len() + tuple.len() + 2;
        if self.pending_rows > 0 && (would_be_len > self.max_query_size || self.pending_rows >= self.batch_cap) {
            self.flush();
        }
        if self.pending_rows > 0 {
            self.buffer.push_str(", ");
        }
        self.buffer.push_str(&tuple);
        self.pending_rows += 1;
    }

    /// Pushes the current buffer as a statement, if non-empty.
    pub fn flush(&mut self) {
        if self.pending_rows == 0 {
            return;
        }
        self.flushed.push(format!("{}{}", self.prefix, self.buffer));
        self.buffer.clear();
        self.pending_rows = 0;
    }

    /// Consumes the builder, flushing any remainder and returning every
    /// statement produced, in order.
    pub fn finish(mut self) -> Vec<String> {
        self.flush();
        self.flushed
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn policy(&self) -> InsertPolicy {
        self.policy
    }
}

/// Lock decoration appended to a remote SELECT/DELETE (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    ForUpdate,
    ShareMode,
}

impl LockMode {
    pub fn suffix(&self) -> &'static str {
        match self {
            LockMode::None => "",
            LockMode::ForUpdate => " FOR UPDATE",
            LockMode::ShareMode => " LOCK IN SHARE MODE",
        }
    }
}

/// `SELECT c1, c2, ... FROM t [WHERE ...] [lock]` (spec §4.E). Columns
/// outside `read_columns` are replaced with `NULL AS <col>` when
/// `prune_columns` is set (independently toggleable for query vs DML per
/// the spec, so the caller decides).
pub fn build_select(
    table: &str,
    all_columns: &[String],
    read_columns: &[String],
    where_body: Option<&str>,
    lock: LockMode,
    prune_columns: bool,
) -> String {
    let projection = if prune_columns {
        all_columns
            .iter()
            .map(|c| {
                if read_columns.iter().any(|r| r == c) {
                    quote_identifier(c)
                } else {
                    format!("NULL AS {}", quote_identifier(c))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        all_columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ")
    };
    let mut sql = format!("SELECT {} FROM {}", projection, quote_identifier(table));
    if let Some(w) = where_body {
        sql.push_str(&format!(" WHERE {}", w));
    }
    sql.push_str(lock.suffix());
    sql
}

/// `UPDATE [IGNORE] t SET col=v, ... WHERE <old-key-condition> [LIMIT 1]`
/// (spec §4.E). Returns `None` and leaves decomposition to the caller when
/// `touches_vindex_column` is set, since that case is a DELETE+INSERT pair
/// rather than a single UPDATE statement.
pub fn build_update(
    table: &str,
    set_columns: &[(String, FedValue)],
    old_key_condition: &str,
    has_primary_key: bool,
    ignore: bool,
    touches_vindex_column: bool,
) -> Option<String> {
    if touches_vindex_column {
        return None;
    }
    let verb = if ignore { "UPDATE IGNORE" } else { "UPDATE" };
    let assignments = set_columns
        .iter()
        .map(|(c, v)| format!("{}={}", quote_identifier(c), v.to_sql_literal()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("{} {} SET {} WHERE {}", verb, quote_identifier(table), assignments, old_key_condition);
    if !has_primary_key {
        sql.push_str(" LIMIT 1");
    }
    Some(sql)
}

/// The DELETE+INSERT decomposition used when an UPDATE would touch a
/// sharding (vindex) column, which the remote refuses natively (spec
/// §4.E). The caller executes `delete` first; if it reports more than one
/// affected row, the whole operation must fail with `FOUND_DUPP_UNIQUE`
/// before `insert` is attempted — enforced by `handler.rs`, not here.
pub struct DecomposedUpdate {
    pub delete: String,
    pub insert: String,
}

pub fn build_decomposed_update(
    table: &str,
    old_image: &[(String, FedValue)],
    new_image: &[(String, FedValue)],
    old_key_condition: &str,
) -> DecomposedUpdate {
    let delete = format!("DELETE FROM {} WHERE {}", quote_identifier(table), old_key_condition);
    let columns: Vec<String> = new_image.iter().map(|(c, _)| c.clone()).collect();
    let values: Vec<FedValue> = new_image.iter().map(|(_, v)| v.clone()).collect();
    let mut builder = BulkInsertBuilder::new(table, &columns, InsertPolicy::Plain, usize::MAX, usize::MAX);
    builder.push_row(&values);
    let insert = builder.finish().remove(0);
    let _ = old_image;
    DecomposedUpdate { delete, insert }
}

/// `DELETE FROM t WHERE <row-condition> [LIMIT n]` (spec §4.E). Omits
/// `LIMIT 1` when a primary key narrows the condition to at most one row;
/// appends a scaled `LIMIT n * expand_factor` for a pushed-down predicate
/// with a local LIMIT, to tolerate partial predicate pushdown.
pub fn build_delete(
    table: &str,
    row_condition: &str,
    has_primary_key_condition: bool,
    pushed_limit: Option<u64>,
    expand_factor: f64,
) -> String {
    let mut sql = format!("DELETE FROM {} WHERE {}", quote_identifier(table), row_condition);
    if let Some(n) = pushed_limit {
        let scaled = ((n as f64) * expand_factor).ceil() as u64;
        sql.push_str(&format!(" LIMIT {}", scaled.max(1)));
    } else if !has_primary_key_condition {
        sql.push_str(" LIMIT 1");
    }
    sql
}

/// Quote-and-comment-aware statement splitter, reused from the bulk-insert
/// replay path when a stored batch needs to be sent one statement at a
/// time (same scanning rules as the teacher's `split_sql_statements`:
/// `'...'`/`"..."` quoting, `--` line comments, nested `/* */` blocks).
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(c) = chars.next() {
        if in_single_quote {
            current.push(c);
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    current.push(chars.next().unwrap());
                } else {
                    in_single_quote = false;
                }
            }
            continue;
        }
        if in_double_quote {
            current.push(c);
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push(chars.next().unwrap());
                } else {
                    in_double_quote = false;
                }
            }
            continue;
        }
        match c {
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut depth = 1u32;
                while depth > 0 {
                    match chars.next() {
                        Some('*') if chars.peek() == Some(&'/') => {
                            chars.next();
                            depth -= 1;
                        }
                        Some('/') if chars.peek() == Some(&'*') => {
                            chars.next();
                            depth += 1;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
            '\'' => {
                current.push(c);
                in_single_quote = true;
            }
            '"' => {
                current.push(c);
                in_double_quote = true;
            }
            ';' => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    statements.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(col: &str, value: FedValue) -> KeyPart {
        KeyPart {
            column: col.to_string(),
            value: Some(value),
            is_null_part: false,
            is_prefix: false,
        }
    }

    #[test]
    fn quote_identifier_doubles_backticks() {
        assert_eq!(quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn exact_range_builds_equality() {
        let range = KeyRange {
            start: Some(KeySide {
                parts: vec![part("id", FedValue::I64(5))],
                flag: Some(RangeFlag::Exact),
            }),
            end: None,
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&range, None).unwrap(), "(`id` = 5)");
    }

    #[test]
    fn exact_in_records_in_range_uses_gte() {
        let range = KeyRange {
            start: Some(KeySide {
                parts: vec![part("id", FedValue::I64(5))],
                flag: Some(RangeFlag::Exact),
            }),
            end: None,
            from_records_in_range: true,
        };
        assert_eq!(where_from_key_range(&range, None).unwrap(), "(`id` >= 5)");
    }

    #[test]
    fn after_flag_differs_by_side() {
        let start_only = KeyRange {
            start: Some(KeySide {
                parts: vec![part("id", FedValue::I64(1))],
                flag: Some(RangeFlag::After),
            }),
            end: None,
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&start_only, None).unwrap(), "(`id` > 1)");

        let end_only = KeyRange {
            start: None,
            end: Some(KeySide {
                parts: vec![part("id", FedValue::I64(1))],
                flag: Some(RangeFlag::After),
            }),
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&end_only, None).unwrap(), "(`id` <= 1)");
    }

    #[test]
    fn both_sides_joined_with_and_and_extra_filter_appended() {
        let range = KeyRange {
            start: Some(KeySide {
                parts: vec![part("id", FedValue::I64(1))],
                flag: Some(RangeFlag::OrNext),
            }),
            end: Some(KeySide {
                parts: vec![part("id", FedValue::I64(9))],
                flag: Some(RangeFlag::Before),
            }),
            from_records_in_range: false,
        };
        let where_body = where_from_key_range(&range, Some("status = 1")).unwrap();
        assert_eq!(where_body, "(`id` >= 1) AND (`id` < 9) AND (status = 1)");
    }

    #[test]
    fn null_part_emits_is_null_only_for_exact() {
        let null_part = KeyPart {
            column: "deleted_at".to_string(),
            value: None,
            is_null_part: true,
            is_prefix: false,
        };
        let exact = KeyRange {
            start: Some(KeySide { parts: vec![null_part.clone()], flag: Some(RangeFlag::Exact) }),
            end: None,
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&exact, None).unwrap(), "(`deleted_at` IS NULL)");

        let after = KeyRange {
            start: Some(KeySide { parts: vec![null_part], flag: Some(RangeFlag::After) }),
            end: None,
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&after, None).unwrap(), "(`deleted_at` IS NOT NULL)");
    }

    #[test]
    fn prefix_exact_emits_like() {
        let prefix_part = KeyPart {
            column: "name".to_string(),
            value: Some(FedValue::Str("foo".to_string())),
            is_null_part: false,
            is_prefix: true,
        };
        let range = KeyRange {
            start: Some(KeySide { parts: vec![prefix_part], flag: Some(RangeFlag::Exact) }),
            end: None,
            from_records_in_range: false,
        };
        assert_eq!(where_from_key_range(&range, None).unwrap(), "(`name` LIKE 'foo%')");
    }

    #[test]
    fn bulk_insert_flushes_when_next_row_would_overflow() {
        let columns = vec!["a".to_string()];
        let mut b = BulkInsertBuilder::new("t", &columns, InsertPolicy::Plain, 40, 100);
        b.push_row(&[FedValue::I64(1)]);
        b.push_row(&[FedValue::I64(2)]);
        b.push_row(&[FedValue::I64(3)]);
        let statements = b.finish();
        assert!(statements.len() >= 2, "expected at least one flush before overflow");
        for s in &statements {
            assert!(s.starts_with("INSERT INTO `t` (`a`) VALUES "));
        }
    }

    #[test]
    fn bulk_insert_respects_batch_cap() {
        let columns = vec!["a".to_string()];
        let mut b = BulkInsertBuilder::new("t", &columns, InsertPolicy::Ignore, usize::MAX, 2);
        for i in 0..5 {
            b.push_row(&[FedValue::I64(i)]);
        }
        let statements = b.finish();
        assert_eq!(statements.len(), 3); // 2 + 2 + 1
        assert!(statements[0].starts_with("INSERT IGNORE INTO"));
    }

    #[test]
    fn empty_column_list_emits_values_unit() {
        let mut b = BulkInsertBuilder::new("t", &[], InsertPolicy::Plain, usize::MAX, usize::MAX);
        b.push_row(&[]);
        let statements = b.finish();
        assert_eq!(statements[0], "INSERT INTO `t` VALUES ()");
    }

    #[test]
    fn update_without_primary_key_appends_limit_one() {
        let sql = build_update(
            "t",
            &[("v".to_string(), FedValue::I64(1))],
            "`id` = 5",
            false,
            false,
            false,
        )
        .unwrap();
        assert!(sql.ends_with("LIMIT 1"));
    }

    #[test]
    fn update_with_primary_key_omits_limit() {
        let sql = build_update(
            "t",
            &[("v".to_string(), FedValue::I64(1))],
            "`id` = 5",
            true,
            false,
            false,
        )
        .unwrap();
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn update_touching_vindex_column_is_declined() {
        assert!(build_update("t", &[], "1=1", true, false, true).is_none());
    }

    #[test]
    fn decomposed_update_produces_delete_then_insert() {
        let decomposed = build_decomposed_update(
            "t",
            &[("shard_key".to_string(), FedValue::I64(1))],
            &[("shard_key".to_string(), FedValue::I64(2))],
            "`id` = 5",
        );
        assert_eq!(decomposed.delete, "DELETE FROM `t` WHERE `id` = 5");
        assert!(decomposed.insert.starts_with("INSERT INTO `t` (`shard_key`) VALUES (2)"));
    }

    #[test]
    fn delete_with_primary_key_omits_limit_one() {
        let sql = build_delete("t", "`id` = 5", true, None, 2.0);
        assert_eq!(sql, "DELETE FROM `t` WHERE `id` = 5");
    }

    #[test]
    fn delete_without_primary_key_gets_limit_one() {
        let sql = build_delete("t", "status = 1", false, None, 2.0);
        assert_eq!(sql, "DELETE FROM `t` WHERE status = 1 LIMIT 1");
    }

    #[test]
    fn delete_with_pushed_limit_scales_by_expand_factor() {
        let sql = build_delete("t", "status = 1", false, Some(3), 2.0);
        assert_eq!(sql, "DELETE FROM `t` WHERE status = 1 LIMIT 6");
    }

    #[test]
    fn select_prunes_unread_columns_to_null() {
        let all = vec!["a".to_string(), "b".to_string()];
        let read = vec!["a".to_string()];
        let sql = build_select("t", &all, &read, Some("`a` = 1"), LockMode::None, true);
        assert_eq!(sql, "SELECT `a`, NULL AS `b` FROM `t` WHERE `a` = 1");
    }

    #[test]
    fn select_for_update_appends_lock_suffix() {
        let all = vec!["a".to_string()];
        let sql = build_select("t", &all, &all, None, LockMode::ForUpdate, false);
        assert_eq!(sql, "SELECT `a` FROM `t` FOR UPDATE");
    }

    #[test]
    fn split_sql_statements_respects_quotes_and_comments() {
        let sql = "INSERT INTO t VALUES ('a;b'); -- comment; with semicolon\nSELECT 1; /* c;omment */ SELECT 2;";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('a;b')");
        assert_eq!(statements[2], "SELECT 2");
    }
}
