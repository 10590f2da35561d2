//! Relational row stores: per-row deletes, updates and inserts applied in
//! one transaction per category.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use osync_core::{FieldValue, Record, StoredRecord};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

/// Where the rows of one category live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table: String,
    /// Text column holding the record key.
    pub key_column: String,
    /// Boolean column set on every inserted row; only rows with `true` are deleted.
    #[serde(default)]
    pub provenance_column: Option<String>,
    #[serde(default)]
    pub scope: Option<ScopeSpec>,
    /// Filled with a fresh UUID on insert.
    #[serde(default)]
    pub id_column: Option<String>,
    /// Receives downloaded file content.
    #[serde(default)]
    pub blob_column: Option<String>,
    /// Set to `CURRENT_TIMESTAMP` on insert.
    #[serde(default)]
    pub insert_timestamps: Vec<String>,
    /// Set to `CURRENT_TIMESTAMP` on insert and on update.
    #[serde(default)]
    pub update_timestamps: Vec<String>,
    /// Record field -> column. When non-empty, unmapped fields are not persisted.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

impl TableSpec {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            provenance_column: None,
            scope: None,
            id_column: None,
            blob_column: None,
            insert_timestamps: Vec::new(),
            update_timestamps: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    /// Projects a parsed record into column space.
    pub fn to_row(&self, record: &Record) -> Record {
        let fields = if self.columns.is_empty() {
            record.fields.clone()
        } else {
            record
                .fields
                .iter()
                .filter_map(|(field, value)| {
                    self.columns
                        .get(field)
                        .map(|column| (column.clone(), value.clone()))
                })
                .collect()
        };
        Record {
            key: record.key.clone(),
            fields,
        }
    }

    fn is_managed(&self, column: &str) -> bool {
        self.blob_column.as_deref() == Some(column)
            || self.insert_timestamps.iter().any(|c| c == column)
            || self.update_timestamps.iter().any(|c| c == column)
    }
}

/// Restricts a table to the rows of one parent entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScopeSpec {
    /// `column = value` for a fixed parent id.
    Fixed { column: String, value: FieldValue },
    /// Parent row looked up by name and created on first use.
    Parent {
        column: String,
        table: String,
        name_column: String,
        name: String,
        id_column: String,
        #[serde(default)]
        insert_timestamps: Vec<String>,
        /// Set on insert and bumped whenever the scoped rows change.
        #[serde(default)]
        update_timestamps: Vec<String>,
    },
}

impl ScopeSpec {
    pub fn column(&self) -> &str {
        match self {
            Self::Fixed { column, .. } | Self::Parent { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub key: String,
    pub columns: BTreeMap<String, FieldValue>,
    pub blob: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowInsert {
    pub key: String,
    pub columns: BTreeMap<String, FieldValue>,
    pub blob: Option<Vec<u8>>,
}

/// Row-level writes in execution order: deletes, updates, inserts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPlan {
    pub deletes: Vec<String>,
    pub updates: Vec<RowUpdate>,
    pub inserts: Vec<RowInsert>,
}

impl RowPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.updates.is_empty() && self.inserts.is_empty()
    }
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Fails with [`StoreError::MissingTable`] when the table is absent.
    async fn ensure_table(&self, spec: &TableSpec) -> Result<(), StoreError>;
    async fn load(&self, spec: &TableSpec) -> Result<Vec<StoredRecord>, StoreError>;
    /// All-or-nothing: on error no change of the plan is visible.
    async fn apply(&self, spec: &TableSpec, plan: &RowPlan) -> Result<(), StoreError>;
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        FieldValue::Bool(b) => query.bind(*b),
        FieldValue::Integer(i) => query.bind(*i),
        FieldValue::Float(f) => query.bind(*f),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}

/// Best-effort decode of a column into a comparable value; columns of other
/// types (timestamps, bytea) are left out.
fn decode_column(row: &PgRow, index: usize) -> Option<FieldValue> {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(FieldValue::Text);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(FieldValue::Integer);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map(|v| FieldValue::Integer(v.into()));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map(|v| FieldValue::Integer(v.into()));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(FieldValue::Bool);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(FieldValue::Float);
    }
    if let Ok(v) = row.try_get::<Option<Uuid>, _>(index) {
        return v.map(|v| FieldValue::Text(v.to_string()));
    }
    None
}

/// PostgreSQL via sqlx.
#[derive(Debug, Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lazy pool: no connection is attempted until the first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(StoreError::from))
            .collect()
    }

    async fn lookup_scope(&self, scope: &ScopeSpec) -> Result<Option<FieldValue>, StoreError> {
        match scope {
            ScopeSpec::Fixed { value, .. } => Ok(Some(value.clone())),
            ScopeSpec::Parent {
                table,
                name_column,
                name,
                id_column,
                ..
            } => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = $1",
                    quote_ident(id_column),
                    quote_ident(table),
                    quote_ident(name_column)
                );
                let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
                Ok(row.and_then(|row| decode_column(&row, 0)))
            }
        }
    }

    async fn resolve_scope(
        tx: &mut Transaction<'_, Postgres>,
        scope: &ScopeSpec,
    ) -> Result<FieldValue, StoreError> {
        let (table, name_column, name, id_column) = match scope {
            ScopeSpec::Fixed { value, .. } => return Ok(value.clone()),
            ScopeSpec::Parent {
                table,
                name_column,
                name,
                id_column,
                ..
            } => (table, name_column, name, id_column),
        };

        let select = format!(
            "SELECT {} FROM {} WHERE {} = $1",
            quote_ident(id_column),
            quote_ident(table),
            quote_ident(name_column)
        );
        if let Some(row) = sqlx::query(&select)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
        {
            let id = decode_column(&row, 0).ok_or_else(|| {
                StoreError::Rejected(format!("unreadable id of {table} `{name}`"))
            })?;
            if let Some(touch) = parent_touch_sql(scope, &id) {
                touch.execute(tx).await?;
            }
            return Ok(id);
        }

        let id = FieldValue::Text(Uuid::new_v4().to_string());
        if let Some(insert) = parent_insert_sql(scope, &id) {
            insert.execute(tx).await?;
        }
        tracing::info!(table = %table, name = %name, "created parent row");
        Ok(id)
    }
}

/// One bound parameter of a [`Statement`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Param<'a> {
    Value(Cow<'a, FieldValue>),
    Keys(&'a [String]),
    Blob(&'a [u8]),
}

/// SQL text and its parameters in `$n` order.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Statement<'a> {
    pub sql: String,
    pub params: Vec<Param<'a>>,
}

impl<'a> Statement<'a> {
    /// Appends a parameter and returns its placeholder.
    fn slot(&mut self, param: Param<'a>) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn value(&mut self, value: &'a FieldValue) -> String {
        self.slot(Param::Value(Cow::Borrowed(value)))
    }

    async fn execute(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), StoreError> {
        let mut query = sqlx::query(&self.sql);
        for param in &self.params {
            query = match param {
                Param::Value(value) => bind_value(query, value),
                Param::Keys(keys) => query.bind(keys.to_vec()),
                Param::Blob(blob) => query.bind(blob.to_vec()),
            };
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }
}

/// Scope column and the parent id rows are pinned to.
type Scope<'a> = Option<(&'a str, &'a FieldValue)>;

fn scope_clause<'a>(statement: &mut Statement<'a>, scope: Scope<'a>) -> String {
    match scope {
        Some((column, value)) => {
            let slot = statement.value(value);
            format!(" AND {} = {slot}", quote_ident(column))
        }
        None => String::new(),
    }
}

/// Removes the given keys, restricted to provenance-flagged rows of the scope.
pub(crate) fn delete_sql<'a>(
    spec: &TableSpec,
    keys: &'a [String],
    scope: Scope<'a>,
) -> Statement<'a> {
    let mut statement = Statement::default();
    let keys_slot = statement.slot(Param::Keys(keys));
    let mut sql = format!(
        "DELETE FROM {} WHERE {} = ANY({keys_slot})",
        quote_ident(&spec.table),
        quote_ident(&spec.key_column)
    );
    if let Some(provenance) = &spec.provenance_column {
        sql.push_str(&format!(" AND {} = TRUE", quote_ident(provenance)));
    }
    sql.push_str(&scope_clause(&mut statement, scope));
    statement.sql = sql;
    statement
}

/// `None` when the update carries neither columns nor content.
pub(crate) fn update_sql<'a>(
    spec: &TableSpec,
    update: &'a RowUpdate,
    scope: Scope<'a>,
) -> Option<Statement<'a>> {
    let mut statement = Statement::default();
    let mut assignments = Vec::new();
    for (column, value) in &update.columns {
        let slot = statement.value(value);
        assignments.push(format!("{} = {slot}", quote_ident(column)));
    }
    if let (Some(column), Some(blob)) = (&spec.blob_column, &update.blob) {
        let slot = statement.slot(Param::Blob(blob));
        assignments.push(format!("{} = {slot}", quote_ident(column)));
    }
    if assignments.is_empty() {
        return None;
    }
    for column in &spec.update_timestamps {
        assignments.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(column)));
    }

    let key = FieldValue::Text(update.key.clone());
    let key_slot = statement.slot(Param::Value(Cow::Owned(key)));
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = {key_slot}",
        quote_ident(&spec.table),
        assignments.join(", "),
        quote_ident(&spec.key_column)
    );
    sql.push_str(&scope_clause(&mut statement, scope));
    statement.sql = sql;
    Some(statement)
}

/// New row flagged with provenance; `id` fills the id column when one is configured.
pub(crate) fn insert_sql<'a>(
    spec: &TableSpec,
    insert: &'a RowInsert,
    scope: Scope<'a>,
    id: Option<FieldValue>,
) -> Statement<'a> {
    let mut statement = Statement::default();
    let mut columns = Vec::new();
    let mut values = Vec::new();

    columns.push(quote_ident(&spec.key_column));
    let key = FieldValue::Text(insert.key.clone());
    values.push(statement.slot(Param::Value(Cow::Owned(key))));
    for (column, value) in &insert.columns {
        columns.push(quote_ident(column));
        values.push(statement.value(value));
    }
    if let Some(provenance) = &spec.provenance_column {
        columns.push(quote_ident(provenance));
        values.push(statement.slot(Param::Value(Cow::Owned(FieldValue::Bool(true)))));
    }
    if let (Some(id_column), Some(id)) = (&spec.id_column, id) {
        columns.push(quote_ident(id_column));
        values.push(statement.slot(Param::Value(Cow::Owned(id))));
    }
    if let Some((column, value)) = scope {
        columns.push(quote_ident(column));
        values.push(statement.value(value));
    }
    if let (Some(column), Some(blob)) = (&spec.blob_column, &insert.blob) {
        columns.push(quote_ident(column));
        values.push(statement.slot(Param::Blob(blob)));
    }
    push_timestamps(
        &mut columns,
        &mut values,
        spec.insert_timestamps.iter().chain(&spec.update_timestamps),
    );

    statement.sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&spec.table),
        columns.join(", "),
        values.join(", ")
    );
    statement
}

fn push_timestamps<'c>(
    columns: &mut Vec<String>,
    values: &mut Vec<String>,
    timestamps: impl Iterator<Item = &'c String>,
) {
    for column in timestamps {
        let quoted = quote_ident(column);
        if !columns.contains(&quoted) {
            columns.push(quoted);
            values.push("CURRENT_TIMESTAMP".to_string());
        }
    }
}

/// Creates the named parent row. `None` for fixed scopes.
pub(crate) fn parent_insert_sql<'a>(
    scope: &'a ScopeSpec,
    id: &'a FieldValue,
) -> Option<Statement<'a>> {
    let ScopeSpec::Parent {
        table,
        name_column,
        name,
        id_column,
        insert_timestamps,
        update_timestamps,
        ..
    } = scope
    else {
        return None;
    };
    let mut statement = Statement::default();
    let mut columns = vec![quote_ident(id_column), quote_ident(name_column)];
    let mut values = vec![
        statement.value(id),
        statement.slot(Param::Value(Cow::Owned(FieldValue::Text(name.clone())))),
    ];
    push_timestamps(
        &mut columns,
        &mut values,
        insert_timestamps.iter().chain(update_timestamps),
    );
    statement.sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        values.join(", ")
    );
    Some(statement)
}

/// Bumps the parent's update timestamps. `None` when there are none to set.
pub(crate) fn parent_touch_sql<'a>(
    scope: &ScopeSpec,
    id: &'a FieldValue,
) -> Option<Statement<'a>> {
    let ScopeSpec::Parent {
        table,
        id_column,
        update_timestamps,
        ..
    } = scope
    else {
        return None;
    };
    if update_timestamps.is_empty() {
        return None;
    }
    let mut statement = Statement::default();
    let assignments = update_timestamps
        .iter()
        .map(|column| format!("{} = CURRENT_TIMESTAMP", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let id_slot = statement.value(id);
    statement.sql = format!(
        "UPDATE {} SET {assignments} WHERE {} = {id_slot}",
        quote_ident(table),
        quote_ident(id_column)
    );
    Some(statement)
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn ensure_table(&self, spec: &TableSpec) -> Result<(), StoreError> {
        if self.columns(&spec.table).await?.is_empty() {
            return Err(StoreError::MissingTable(spec.table.clone()));
        }
        if let Some(ScopeSpec::Parent { table, .. }) = &spec.scope {
            if self.columns(table).await?.is_empty() {
                return Err(StoreError::MissingTable(table.clone()));
            }
        }
        Ok(())
    }

    async fn load(&self, spec: &TableSpec) -> Result<Vec<StoredRecord>, StoreError> {
        let columns: Vec<String> = self
            .columns(&spec.table)
            .await?
            .into_iter()
            .filter(|c| !spec.is_managed(c))
            .collect();
        if columns.is_empty() {
            return Err(StoreError::MissingTable(spec.table.clone()));
        }

        let select = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {select} FROM {}", quote_ident(&spec.table));
        let scope_value = match &spec.scope {
            Some(scope) => match self.lookup_scope(scope).await? {
                Some(value) => {
                    sql.push_str(&format!(" WHERE {} = $1", quote_ident(scope.column())));
                    Some(value)
                }
                // Parent not created yet, so nothing is stored for this scope.
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut query = sqlx::query(&sql);
        if let Some(value) = &scope_value {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut key = None;
            let mut fields = BTreeMap::new();
            for (index, column) in columns.iter().enumerate() {
                let Some(value) = decode_column(row, index) else {
                    continue;
                };
                if column == &spec.key_column {
                    key = Some(value.to_string());
                } else {
                    fields.insert(column.clone(), value);
                }
            }
            match key {
                Some(key) => records.push(StoredRecord { key, fields }),
                None => tracing::warn!(table = %spec.table, "skipping row without key"),
            }
        }
        Ok(records)
    }

    async fn apply(&self, spec: &TableSpec, plan: &RowPlan) -> Result<(), StoreError> {
        if plan.is_empty() {
            return Ok(());
        }

        // Dropping the transaction without commit rolls everything back.
        let mut tx = self.pool.begin().await?;
        let scope_value = match &spec.scope {
            Some(scope) => Some(Self::resolve_scope(&mut tx, scope).await?),
            None => None,
        };
        let scope = spec
            .scope
            .as_ref()
            .zip(scope_value.as_ref())
            .map(|(s, v)| (s.column(), v));

        if !plan.deletes.is_empty() {
            delete_sql(spec, &plan.deletes, scope).execute(&mut tx).await?;
        }
        for update in &plan.updates {
            if let Some(statement) = update_sql(spec, update, scope) {
                statement.execute(&mut tx).await?;
            }
        }
        for insert in &plan.inserts {
            let id = spec
                .id_column
                .as_ref()
                .map(|_| FieldValue::Text(Uuid::new_v4().to_string()));
            insert_sql(spec, insert, scope, id).execute(&mut tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// One stored row, column name to value.
pub type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    blobs: BTreeMap<(String, String), Vec<u8>>,
    fail_next_apply: bool,
}

/// In-memory transactional row store: a plan is staged on a copy of the
/// tables and swapped in only when every step succeeded.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    state: Mutex<MemoryState>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `table` if needed and appends `row`.
    pub async fn insert_row(&self, table: &str, row: Row) {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default().push(row);
    }

    pub async fn create_table(&self, table: &str) {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default();
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub async fn blob(&self, table: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .blobs
            .get(&(table.to_string(), key.to_string()))
            .cloned()
    }

    /// Makes the next `apply` fail after staging its writes.
    pub async fn fail_next_apply(&self) {
        self.state.lock().await.fail_next_apply = true;
    }

    fn scope_value(
        tables: &mut BTreeMap<String, Vec<Row>>,
        scope: &ScopeSpec,
        create: bool,
    ) -> Option<FieldValue> {
        match scope {
            ScopeSpec::Fixed { value, .. } => Some(value.clone()),
            ScopeSpec::Parent {
                table,
                name_column,
                name,
                id_column,
                ..
            } => {
                let parents = tables.entry(table.clone()).or_default();
                let found = parents
                    .iter()
                    .find(|row| row.get(name_column).and_then(FieldValue::as_text) == Some(name.as_str()))
                    .and_then(|row| row.get(id_column).cloned());
                if found.is_some() || !create {
                    return found;
                }
                let id = FieldValue::Text(Uuid::new_v4().to_string());
                let mut row = Row::new();
                row.insert(id_column.clone(), id.clone());
                row.insert(name_column.clone(), FieldValue::Text(name.clone()));
                parents.push(row);
                Some(id)
            }
        }
    }

    fn in_scope(row: &Row, scope: Option<&(String, FieldValue)>) -> bool {
        scope.map_or(true, |(column, value)| row.get(column) == Some(value))
    }

    fn key_of(row: &Row, spec: &TableSpec) -> Option<String> {
        row.get(&spec.key_column).map(ToString::to_string)
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn ensure_table(&self, spec: &TableSpec) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        if state.tables.contains_key(&spec.table) {
            Ok(())
        } else {
            Err(StoreError::MissingTable(spec.table.clone()))
        }
    }

    async fn load(&self, spec: &TableSpec) -> Result<Vec<StoredRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let scope = match &spec.scope {
            Some(scope) => match Self::scope_value(&mut state.tables, scope, false) {
                Some(value) => Some((scope.column().to_string(), value)),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let rows = state
            .tables
            .get(&spec.table)
            .ok_or_else(|| StoreError::MissingTable(spec.table.clone()))?;
        Ok(rows
            .iter()
            .filter(|row| Self::in_scope(row, scope.as_ref()))
            .filter_map(|row| {
                let key = Self::key_of(row, spec)?;
                let fields = row
                    .iter()
                    .filter(|(column, _)| *column != &spec.key_column && !spec.is_managed(column))
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect();
                Some(StoredRecord { key, fields })
            })
            .collect())
    }

    async fn apply(&self, spec: &TableSpec, plan: &RowPlan) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut tables = state.tables.clone();
        let mut blobs = state.blobs.clone();

        let scope = match &spec.scope {
            Some(scope) => Self::scope_value(&mut tables, scope, true)
                .map(|value| (scope.column().to_string(), value)),
            None => None,
        };
        let rows = tables
            .get_mut(&spec.table)
            .ok_or_else(|| StoreError::MissingTable(spec.table.clone()))?;

        rows.retain(|row| {
            let doomed = Self::in_scope(row, scope.as_ref())
                && Self::key_of(row, spec).is_some_and(|k| plan.deletes.contains(&k))
                && spec
                    .provenance_column
                    .as_ref()
                    .map_or(true, |p| row.get(p) == Some(&FieldValue::Bool(true)));
            !doomed
        });

        for update in &plan.updates {
            let row = rows
                .iter_mut()
                .find(|row| {
                    Self::in_scope(row, scope.as_ref())
                        && Self::key_of(row, spec).as_deref() == Some(update.key.as_str())
                })
                .ok_or_else(|| StoreError::Rejected(format!("no row with key `{}`", update.key)))?;
            for (column, value) in &update.columns {
                row.insert(column.clone(), value.clone());
            }
            if let Some(blob) = &update.blob {
                blobs.insert((spec.table.clone(), update.key.clone()), blob.clone());
            }
        }

        for insert in &plan.inserts {
            let mut row = insert.columns.clone();
            row.insert(spec.key_column.clone(), FieldValue::Text(insert.key.clone()));
            if let Some(provenance) = &spec.provenance_column {
                row.insert(provenance.clone(), FieldValue::Bool(true));
            }
            if let Some(id_column) = &spec.id_column {
                row.insert(id_column.clone(), FieldValue::Text(Uuid::new_v4().to_string()));
            }
            if let Some((column, value)) = &scope {
                row.insert(column.clone(), value.clone());
            }
            rows.push(row);
            if let Some(blob) = &insert.blob {
                blobs.insert((spec.table.clone(), insert.key.clone()), blob.clone());
            }
        }

        if std::mem::take(&mut state.fail_next_apply) {
            return Err(StoreError::Rejected("injected failure, transaction rolled back".into()));
        }
        state.tables = tables;
        state.blobs = blobs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees_spec() -> TableSpec {
        let mut spec = TableSpec::new("employees", "name");
        spec.scope = Some(ScopeSpec::Fixed {
            column: "contactId".into(),
            value: FieldValue::Integer(1),
        });
        spec
    }

    fn row(pairs: &[(&str, FieldValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("fileSize"), "\"fileSize\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn column_mapping_drops_unmapped_fields() {
        let mut spec = TableSpec::new("File", "name");
        spec.columns.insert("file_size".into(), "fileSize".into());
        let record = Record::new("a.pdf")
            .with("file_size", Some(10_i64))
            .with("url", Some("https://obec.test/a.pdf"));
        let projected = spec.to_row(&record);
        assert_eq!(projected.fields.len(), 1);
        assert_eq!(projected.get("fileSize"), Some(&FieldValue::Integer(10)));
    }

    fn files_spec() -> TableSpec {
        let mut spec = TableSpec::new("File", "name");
        spec.provenance_column = Some("fromWebsite".into());
        spec.id_column = Some("id".into());
        spec.blob_column = Some("content".into());
        spec.update_timestamps = vec!["uploadDate".into()];
        spec.scope = Some(ScopeSpec::Parent {
            column: "folderId".into(),
            table: "Folder".into(),
            name_column: "name".into(),
            name: "Zastupitelstvo".into(),
            id_column: "id".into(),
            insert_timestamps: vec!["createdAt".into()],
            update_timestamps: vec!["updatedAt".into()],
        });
        spec
    }

    fn text(value: &str) -> Param<'static> {
        Param::Value(Cow::Owned(FieldValue::from(value)))
    }

    #[test]
    fn delete_is_guarded_by_provenance_and_scope() {
        let spec = files_spec();
        let keys = vec!["old.pdf".to_string()];
        let folder = FieldValue::from("f-1");
        let statement = delete_sql(&spec, &keys, Some(("folderId", &folder)));
        assert_eq!(
            statement.sql,
            r#"DELETE FROM "File" WHERE "name" = ANY($1) AND "fromWebsite" = TRUE AND "folderId" = $2"#
        );
        assert_eq!(statement.params, vec![Param::Keys(&keys), text("f-1")]);
    }

    #[test]
    fn delete_without_provenance_removes_any_scoped_row() {
        let keys = vec!["Jan".to_string()];
        let contact = FieldValue::Integer(1);
        let statement = delete_sql(&employees_spec(), &keys, Some(("contactId", &contact)));
        assert_eq!(
            statement.sql,
            r#"DELETE FROM "employees" WHERE "name" = ANY($1) AND "contactId" = $2"#
        );

        let unscoped = delete_sql(&TableSpec::new("employees", "name"), &keys, None);
        assert_eq!(unscoped.sql, r#"DELETE FROM "employees" WHERE "name" = ANY($1)"#);
        assert_eq!(unscoped.params.len(), 1);
    }

    #[test]
    fn update_numbers_content_key_and_scope_after_columns() {
        let spec = files_spec();
        let update = RowUpdate {
            key: "zapis.pdf".into(),
            columns: [
                ("fileSize".to_string(), FieldValue::Integer(2048)),
                ("mimeType".to_string(), FieldValue::from("application/pdf")),
            ]
            .into_iter()
            .collect(),
            blob: Some(b"%PDF".to_vec()),
        };
        let folder = FieldValue::from("f-1");
        let statement = update_sql(&spec, &update, Some(("folderId", &folder))).unwrap();
        assert_eq!(
            statement.sql,
            concat!(
                r#"UPDATE "File" SET "fileSize" = $1, "mimeType" = $2, "content" = $3, "#,
                r#""uploadDate" = CURRENT_TIMESTAMP WHERE "name" = $4 AND "folderId" = $5"#
            )
        );
        assert_eq!(
            statement.params,
            vec![
                Param::Value(Cow::Owned(FieldValue::Integer(2048))),
                text("application/pdf"),
                Param::Blob(b"%PDF"),
                text("zapis.pdf"),
                text("f-1"),
            ]
        );
    }

    #[test]
    fn update_without_columns_is_skipped() {
        let update = RowUpdate {
            key: "zapis.pdf".into(),
            ..RowUpdate::default()
        };
        assert!(update_sql(&files_spec(), &update, None).is_none());
    }

    #[test]
    fn insert_sets_provenance_id_scope_content_and_timestamps() {
        let spec = files_spec();
        let insert = RowInsert {
            key: "zapis.pdf".into(),
            columns: [("fileType".to_string(), FieldValue::from("pdf"))]
                .into_iter()
                .collect(),
            blob: Some(b"%PDF".to_vec()),
        };
        let folder = FieldValue::from("f-1");
        let statement = insert_sql(
            &spec,
            &insert,
            Some(("folderId", &folder)),
            Some(FieldValue::from("u-1")),
        );
        assert_eq!(
            statement.sql,
            concat!(
                r#"INSERT INTO "File" ("name", "fileType", "fromWebsite", "id", "folderId", "content", "uploadDate") "#,
                r#"VALUES ($1, $2, $3, $4, $5, $6, CURRENT_TIMESTAMP)"#
            )
        );
        assert_eq!(statement.params.len(), 6);
        assert_eq!(statement.params[2], Param::Value(Cow::Owned(FieldValue::Bool(true))));
        assert_eq!(statement.params[3], text("u-1"));
        assert_eq!(statement.params[5], Param::Blob(b"%PDF"));
    }

    #[test]
    fn insert_leaves_serial_ids_to_the_database() {
        let mut spec = employees_spec();
        spec.insert_timestamps = vec!["createdAt".into(), "lastUpdated".into()];
        spec.update_timestamps = vec!["lastUpdated".into()];
        let insert = RowInsert {
            key: "Jan".into(),
            columns: [("position".to_string(), FieldValue::from("starosta"))]
                .into_iter()
                .collect(),
            blob: None,
        };
        let contact = FieldValue::Integer(1);
        let statement = insert_sql(&spec, &insert, Some(("contactId", &contact)), None);
        assert_eq!(
            statement.sql,
            concat!(
                r#"INSERT INTO "employees" ("name", "position", "contactId", "createdAt", "lastUpdated") "#,
                r#"VALUES ($1, $2, $3, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)"#
            )
        );
        assert_eq!(statement.params.last(), Some(&Param::Value(Cow::Borrowed(&contact))));
    }

    #[test]
    fn parent_rows_get_both_timestamps() {
        let spec = files_spec();
        let scope = spec.scope.as_ref().unwrap();
        let id = FieldValue::from("f-1");

        let insert = parent_insert_sql(scope, &id).unwrap();
        assert_eq!(
            insert.sql,
            r#"INSERT INTO "Folder" ("id", "name", "createdAt", "updatedAt") VALUES ($1, $2, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)"#
        );
        assert_eq!(insert.params, vec![text("f-1"), text("Zastupitelstvo")]);

        let touch = parent_touch_sql(scope, &id).unwrap();
        assert_eq!(
            touch.sql,
            r#"UPDATE "Folder" SET "updatedAt" = CURRENT_TIMESTAMP WHERE "id" = $1"#
        );

        let fixed = employees_spec();
        let fixed_scope = fixed.scope.as_ref().unwrap();
        assert!(parent_insert_sql(fixed_scope, &id).is_none());
        assert!(parent_touch_sql(fixed_scope, &id).is_none());
    }

    #[tokio::test]
    async fn memory_store_scopes_rows() {
        let store = MemoryRowStore::new();
        store
            .insert_row(
                "employees",
                row(&[
                    ("name", "Jan".into()),
                    ("contactId", FieldValue::Integer(1)),
                ]),
            )
            .await;
        store
            .insert_row(
                "employees",
                row(&[
                    ("name", "Eva".into()),
                    ("contactId", FieldValue::Integer(2)),
                ]),
            )
            .await;
        let loaded = store.load(&employees_spec()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "Jan");
    }

    #[tokio::test]
    async fn failed_apply_leaves_tables_untouched() {
        let store = MemoryRowStore::new();
        store
            .insert_row(
                "employees",
                row(&[
                    ("name", "Jan".into()),
                    ("contactId", FieldValue::Integer(1)),
                ]),
            )
            .await;
        let before = store.rows("employees").await;
        store.fail_next_apply().await;

        let plan = RowPlan {
            deletes: vec!["Jan".into()],
            inserts: vec![RowInsert {
                key: "Eva".into(),
                ..RowInsert::default()
            }],
            ..RowPlan::default()
        };
        assert!(store.apply(&employees_spec(), &plan).await.is_err());
        assert_eq!(store.rows("employees").await, before);

        store.apply(&employees_spec(), &plan).await.unwrap();
        let after = store.rows("employees").await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0]["name"], FieldValue::from("Eva"));
    }

    #[tokio::test]
    async fn parent_scope_is_created_on_first_apply() {
        let store = MemoryRowStore::new();
        store.create_table("File").await;
        let mut spec = TableSpec::new("File", "name");
        spec.scope = Some(ScopeSpec::Parent {
            column: "folderId".into(),
            table: "Folder".into(),
            name_column: "name".into(),
            name: "Zastupitelstvo".into(),
            id_column: "id".into(),
            insert_timestamps: Vec::new(),
            update_timestamps: Vec::new(),
        });
        assert!(store.load(&spec).await.unwrap().is_empty());

        let plan = RowPlan {
            inserts: vec![RowInsert {
                key: "zapis.pdf".into(),
                blob: Some(b"%PDF".to_vec()),
                ..RowInsert::default()
            }],
            ..RowPlan::default()
        };
        store.apply(&spec, &plan).await.unwrap();
        assert_eq!(store.rows("Folder").await.len(), 1);
        assert_eq!(store.load(&spec).await.unwrap().len(), 1);
        assert_eq!(store.blob("File", "zapis.pdf").await, Some(b"%PDF".to_vec()));
    }
}
