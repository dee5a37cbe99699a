use sqlx::{Postgres, Transaction};

mod m000001;
mod m000002;

/// One embedded migration: an ordered list of statements run inside a single
/// transaction. Statements reference the target schema through the
/// `:PDOFLOW_SCHEMA` placeholder.
pub struct PdoflowMigration {
    number: u32,
    name: &'static str,
    pub(crate) stmts: &'static [&'static str],
}

impl PdoflowMigration {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn execute<'e>(
        &self,
        tx: &mut Transaction<'e, Postgres>,
        escaped_schema: &str,
    ) -> Result<(), sqlx::Error> {
        for stmt in self.stmts {
            let stmt = stmt.replace(":PDOFLOW_SCHEMA", escaped_schema);
            sqlx::query(&stmt).execute(tx.as_mut()).await?;
        }

        Ok(())
    }
}

pub const PDOFLOW_MIGRATIONS: &[PdoflowMigration] = &[
    m000001::M000001_MIGRATION,
    m000002::M000002_MIGRATION,
];
