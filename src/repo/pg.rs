#![cfg(feature = "db")]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{
    Alias, Expr, Keyword, OnConflict, PostgresQueryBuilder, Query, SelectStatement, SimpleExpr,
};
use sea_query_binder::SqlxBinder;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Column, PgPool, Row as _, TypeInfo,
};
use tracing::{debug, info};

use super::{Condition, Op, Order, Row, Select, Storage, StorageError, Value};

/// Postgres-backed storage for one schema. Statements are built by
/// sea-query from the column/condition data handed in by the core.
pub struct PgStorage {
    pool: PgPool,
    schema: &'static str,
}

impl PgStorage {
    pub async fn connect(
        url: &str,
        schema: &'static str,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        info!(schema, "postgres pool ready");
        Ok(Self { pool, schema })
    }

    fn table(&self, table: &str) -> (Alias, Alias) {
        (Alias::new(self.schema), Alias::new(table))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.pool.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

fn to_expr(value: &Value) -> SimpleExpr {
    match value {
        Value::Null => SimpleExpr::Keyword(Keyword::Null),
        Value::Bool(v) => SimpleExpr::Value((*v).into()),
        Value::Int(v) => SimpleExpr::Value((*v).into()),
        Value::Float(v) => SimpleExpr::Value((*v).into()),
        Value::Text(v) => SimpleExpr::Value(v.clone().into()),
        Value::Time(v) => SimpleExpr::Value((*v).into()),
        Value::Json(v) => SimpleExpr::Value(v.clone().into()),
    }
}

fn to_where(condition: &Condition) -> SimpleExpr {
    let column = Expr::col(Alias::new(&condition.column));
    let value = to_expr(&condition.value);
    match condition.op {
        Op::Eq => column.eq(value),
        Op::Lt => column.lt(value),
        Op::Le => column.lte(value),
        Op::Gt => column.gt(value),
        Op::Ge => column.gte(value),
    }
}

fn query_error(table: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Query {
        table: table.to_string(),
        message: e.to_string(),
    }
}

/// Decode a row without knowing its table layout up front.
fn decode(row: &PgRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value: Value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
            "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
            "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(i64::from).into(),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
            "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
            "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(idx)?.into(),
            "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(idx)?.into(),
            _ => row.try_get::<Option<String>, _>(idx)?.into(),
        };
        out.set(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl Storage for PgStorage {
    async fn insert(&self, table: &str, row: Row) -> Result<i64, StorageError> {
        self.ensure_open()?;
        let (sql, values) = Query::insert()
            .into_table(self.table(table))
            .columns(row.iter().map(|(c, _)| Alias::new(c)))
            .values(row.iter().map(|(_, v)| to_expr(v)))
            .map_err(|e| query_error(table, e))?
            .returning_col(Alias::new("id"))
            .build_sqlx(PostgresQueryBuilder);

        let rec = sqlx::query_with(&sql, values).fetch_one(&self.pool).await?;
        let id: i64 = rec.try_get("id")?;
        debug!(schema = self.schema, table, id, "inserted row");
        Ok(id)
    }

    async fn insert_or_update(
        &self,
        table: &str,
        row: Row,
        conflict_keys: &[&str],
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let updates: Vec<Alias> = row
            .iter()
            .map(|(c, _)| c)
            .filter(|c| !conflict_keys.contains(&c.as_str()))
            .map(Alias::new)
            .collect();

        let mut conflict = OnConflict::columns(conflict_keys.iter().map(|k| Alias::new(*k)));
        if updates.is_empty() {
            conflict.do_nothing();
        } else {
            conflict.update_columns(updates);
        }

        let (sql, values) = Query::insert()
            .into_table(self.table(table))
            .columns(row.iter().map(|(c, _)| Alias::new(c)))
            .values(row.iter().map(|(_, v)| to_expr(v)))
            .map_err(|e| query_error(table, e))?
            .on_conflict(conflict)
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Row>, StorageError> {
        self.ensure_open()?;
        let mut stmt: SelectStatement = Query::select();
        if query.columns.is_empty() {
            stmt.column(sea_query::Asterisk);
        } else {
            stmt.columns(query.columns.iter().map(Alias::new));
        }
        stmt.from(self.table(table));
        for condition in &query.conditions {
            stmt.and_where(to_where(condition));
        }
        if let Some((column, order)) = &query.order_by {
            let order = match order {
                Order::Asc => sea_query::Order::Asc,
                Order::Desc => sea_query::Order::Desc,
            };
            stmt.order_by(Alias::new(column), order);
        }
        if let Some(limit) = query.limit {
            stmt.limit(limit as u64);
        }

        let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| decode(r).map_err(StorageError::from))
            .collect()
    }

    async fn remove(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let mut stmt = Query::delete();
        stmt.from_table(self.table(table));
        for condition in conditions {
            stmt.and_where(to_where(condition));
        }
        let (sql, values) = stmt.build_sqlx(PostgresQueryBuilder);
        let done = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        info!(schema = self.schema, "postgres pool closed");
        Ok(())
    }
}
