//! In-memory table/column descriptors driving row decoding.
//!
//! The catalog is warmed up from the data dictionary at startup and read
//! concurrently by the parser afterwards; late discoveries go through the
//! same idempotent insert.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::RwLock;

use crate::connector::{Connector, Result};

#[derive(Debug, Clone)]
pub struct Column {
    pub col_no: u64,
    pub seg_col_no: u64,
    pub name: String,
    pub type_no: u64,
    pub length: u64,
    /// -1 when the dictionary holds NULL.
    pub precision: i64,
    /// -1 when the dictionary holds NULL.
    pub scale: i64,
    pub num_pk: u64,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct Table {
    /// Logical object number, the catalog key.
    pub objn: u64,
    /// Physical (data) object number.
    pub objd: u64,
    pub owner: String,
    pub name: String,
    pub dependencies: bool,
    pub clu_cols: u64,
    pub options: u64,
    /// Ordered by segment column number.
    pub columns: Vec<Column>,
    pub total_cols: u64,
    pub total_pk: u64,
}

impl Table {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<u64, Arc<Table>>>,
}

const TABLES_MATCHING_SQL: &str = "SELECT TAB.DATAOBJ# AS OBJD, TAB.OBJ# AS OBJN, \
     TAB.CLUCOLS AS CLUCOLS, USR.USERNAME AS OWNER, OBJ.NAME AS NAME, \
     DECODE(BITAND(TAB.FLAGS, 8388608), 8388608, 1, 0) AS DEPENDENCIES \
     FROM SYS.TAB$ TAB, SYS.OBJ$ OBJ, ALL_USERS USR \
     WHERE TAB.OBJ# = OBJ.OBJ# \
     AND OBJ.OWNER# = USR.USER_ID \
     AND USR.USERNAME || '.' || OBJ.NAME LIKE :pattern";

const TABLE_COLUMNS_SQL: &str = "SELECT C.COL#, C.SEGCOL#, C.NAME, C.TYPE#, C.LENGTH, \
     C.PRECISION#, C.SCALE, C.NULL$, \
     (SELECT COUNT(*) FROM SYS.CCOL$ L JOIN SYS.CDEF$ D ON D.CON# = L.CON# AND D.TYPE# = 2 \
      WHERE L.INTCOL# = C.INTCOL# AND L.OBJ# = C.OBJ#) AS NUMPK \
     FROM SYS.COL$ C WHERE C.OBJ# = :objn ORDER BY C.SEGCOL#";

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, objn: u64) -> Option<Arc<Table>> {
        self.tables.read().get(&objn).cloned()
    }

    /// Idempotent on `objn`: the first descriptor wins, later duplicates
    /// from redundant discovery are ignored.
    pub fn insert(&self, table: Table) {
        self.tables
            .write()
            .entry(table.objn)
            .or_insert_with(|| Arc::new(table));
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Materializes descriptors for every table whose `OWNER.NAME` matches
    /// the SQL-like pattern. Failures leave a partial catalog behind and are
    /// not fatal.
    pub fn add_tables_matching(&self, connector: &mut Connector, pattern: &str, options: u64) {
        info!("reading table schema for: {}", pattern);
        match self.add_tables_inner(connector, pattern, options) {
            Ok(count) => info!("tables matching {}: {} total", pattern, count),
            Err(e) => {
                connector.invalidate();
                error!("getting table metadata for {}: {}", pattern, e);
            }
        }
    }

    fn add_tables_inner(
        &self,
        connector: &mut Connector,
        pattern: &str,
        options: u64,
    ) -> Result<u64> {
        let connection = connector.ensure_connected()?;
        let mut count = 0;

        debug!("{}", TABLES_MATCHING_SQL);
        let rows = connection.query_as::<(
            Option<u64>,
            u64,
            Option<u64>,
            String,
            String,
            u64,
        )>(TABLES_MATCHING_SQL, &[&pattern])?;

        for row in rows {
            let (objd, objn, clu_cols, owner, name, dependencies) = row?;

            // Partitioned and index-organized tables have no physical
            // object and cannot be decoded from redo.
            let Some(objd) = objd else {
                info!("  * skipped: {}.{} (OBJN: {}) - partitioned or IOT", owner, name, objn);
                continue;
            };

            info!(
                "  * found: {}.{} (OBJD: {}, OBJN: {}, DEP: {})",
                owner, name, objd, objn, dependencies
            );

            let mut columns = Vec::new();
            let mut total_pk = 0;
            debug!("{}", TABLE_COLUMNS_SQL);
            let column_rows = connection.query_as::<(
                u64,
                u64,
                String,
                u64,
                u64,
                Option<i64>,
                Option<i64>,
                i64,
                u64,
            )>(TABLE_COLUMNS_SQL, &[&objn])?;

            for column_row in column_rows {
                let (col_no, seg_col_no, name, type_no, length, precision, scale, null_flag, num_pk) =
                    column_row?;
                total_pk += num_pk;
                columns.push(Column {
                    col_no,
                    seg_col_no,
                    name,
                    type_no,
                    length,
                    precision: precision.unwrap_or(-1),
                    scale: scale.unwrap_or(-1),
                    num_pk,
                    nullable: null_flag == 0,
                });
            }

            let total_cols = columns.len() as u64;
            count += 1;
            self.insert(Table {
                objn,
                objd,
                owner,
                name,
                dependencies: dependencies != 0,
                clu_cols: clu_cols.unwrap_or(0),
                options,
                columns,
                total_cols,
                total_pk,
            });
        }

        Ok(count)
    }
}
