use crate::graph::{PAIRS_TABLE, TITLES_TABLE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// DDL for one table: columns, table constraints and supporting indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<String>,
    pub indexes: Vec<String>,
}

impl TableSchema {
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect();
        parts.extend(self.constraints.iter().cloned());

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            self.name,
            parts.join(",\n    ")
        );
        for index in &self.indexes {
            sql.push('\n');
            sql.push_str(index);
            sql.push(';');
        }
        sql
    }
}

pub fn titles_schema() -> TableSchema {
    TableSchema {
        name: TITLES_TABLE,
        primary_key: "title_id",
        columns: vec![
            ColumnDef {
                name: "title_id",
                sql_type: "UUID PRIMARY KEY",
            },
            ColumnDef {
                name: "name",
                sql_type: "VARCHAR(255) NOT NULL UNIQUE",
            },
            ColumnDef {
                name: "created_at",
                sql_type: "TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
            ColumnDef {
                name: "updated_at",
                sql_type: "TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ],
        constraints: Vec::new(),
        indexes: Vec::new(),
    }
}

pub fn pairs_schema() -> TableSchema {
    TableSchema {
        name: PAIRS_TABLE,
        primary_key: "pair_id",
        columns: vec![
            ColumnDef {
                name: "pair_id",
                sql_type: "UUID PRIMARY KEY",
            },
            ColumnDef {
                name: "title_src",
                sql_type: "UUID NOT NULL",
            },
            ColumnDef {
                name: "title_dst",
                sql_type: "UUID NOT NULL",
            },
            ColumnDef {
                name: "created_at",
                sql_type: "TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
            ColumnDef {
                name: "updated_at",
                sql_type: "TIMESTAMPTZ NOT NULL DEFAULT now()",
            },
        ],
        constraints: vec![
            format!("FOREIGN KEY (title_src) REFERENCES {}(title_id)", TITLES_TABLE),
            format!("FOREIGN KEY (title_dst) REFERENCES {}(title_id)", TITLES_TABLE),
            "UNIQUE (title_src, title_dst)".to_string(),
        ],
        indexes: vec![format!(
            "CREATE INDEX IF NOT EXISTS pairs_title_dst_idx ON {} (title_dst)",
            PAIRS_TABLE
        )],
    }
}

/// Tables in creation order.
pub fn graph_schemas() -> Vec<TableSchema> {
    vec![titles_schema(), pairs_schema()]
}
