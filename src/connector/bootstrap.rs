//! One-shot startup verification against the data dictionary.
//!
//! Everything here must succeed before the scheduler starts: archival mode,
//! minimal supplemental logging, endianness, incarnation, and a resume
//! position when no checkpoint exists.

use log::{debug, error, info};

use crate::connector::checkpoint::Checkpoint;
use crate::connector::replicate::codec::byte_order_for;
use crate::connector::{Connector, Error, ReaderState, Result, Scn};

const DATABASE_SQL: &str = "SELECT D.LOG_MODE, D.SUPPLEMENTAL_LOG_DATA_MIN, TP.ENDIAN_FORMAT, \
     D.CURRENT_SCN, DI.RESETLOGS_ID, VER.BANNER, SYS_CONTEXT('USERENV','DB_NAME') AS DB_NAME \
     FROM SYS.V_$DATABASE D \
     JOIN SYS.V_$TRANSPORTABLE_PLATFORM TP ON TP.PLATFORM_NAME = D.PLATFORM_NAME \
     JOIN SYS.V_$VERSION VER ON VER.BANNER LIKE '%Oracle Database%' \
     JOIN SYS.V_$DATABASE_INCARNATION DI ON DI.STATUS = 'CURRENT'";

const CON_ID_SQL: &str = "SELECT SYS_CONTEXT('USERENV','CON_ID') AS CON_ID FROM DUAL";

const CURRENT_SEQUENCE_SQL: &str = "SELECT SEQUENCE# FROM SYS.V_$LOG WHERE STATUS = 'CURRENT'";

#[derive(Debug)]
struct DatabaseAttributes {
    log_mode: String,
    supplemental_log_data_min: String,
    endian_format: String,
    current_scn: Scn,
    resetlogs_id: u32,
    banner: String,
    db_name: String,
}

/// Verifies the database, reconciles the checkpoint, and produces the fully
/// initialized reader state the scheduler runs with.
pub fn bootstrap(
    connector: &mut Connector,
    database: &str,
    checkpoint: &Checkpoint,
) -> Result<ReaderState> {
    let stored = checkpoint.load();

    let attributes = database_attributes(connector)?;

    if attributes.log_mode != "ARCHIVELOG" {
        error!("database not in ARCHIVELOG mode, run:");
        error!(" SHUTDOWN IMMEDIATE;");
        error!(" STARTUP MOUNT;");
        error!(" ALTER DATABASE ARCHIVELOG;");
        error!(" ALTER DATABASE OPEN;");
        return Err(Error::NotArchiveLog);
    }

    if attributes.supplemental_log_data_min != "YES" {
        error!("SUPPLEMENTAL_LOG_DATA_MIN missing, run:");
        error!(" ALTER DATABASE ADD SUPPLEMENTAL LOG DATA;");
        error!(" ALTER SYSTEM ARCHIVE LOG CURRENT;");
        return Err(Error::NoSupplementalLog);
    }

    let resetlogs = reconcile_incarnation(
        stored.as_ref().map_or(0, |record| record.resetlogs),
        attributes.resetlogs_id,
    )?;

    let version = parse_version(&attributes.banner)
        .ok_or_else(|| Error::BadDictionaryValue(format!("version banner {}", attributes.banner)))?;
    info!("- version: {}", attributes.banner);

    let con_id = if version >= 0x12000 {
        let con_id = container_id(connector)?;
        info!("- con_id: {}", con_id);
        con_id
    } else {
        0
    };

    let big_endian = attributes.endian_format == "Big";

    let mut sequence = stored.as_ref().map_or(0, |record| record.sequence);
    let mut scn = stored.as_ref().map_or(0, |record| record.scn);
    if sequence == 0 || scn == 0 {
        sequence = current_sequence(connector)?;
        scn = attributes.current_scn;
    }

    info!("- database: {}", attributes.db_name);
    info!("- sequence: {}", sequence);
    info!("- scn: {}", scn);
    info!("- resetlogs: {}", resetlogs);

    Ok(ReaderState {
        database: database.to_string(),
        sequence,
        scn,
        resetlogs,
        version,
        con_id,
        big_endian,
        byte_order: byte_order_for(big_endian),
    })
}

fn database_attributes(connector: &mut Connector) -> Result<DatabaseAttributes> {
    let connection = connector.ensure_connected()?;
    debug!("{}", DATABASE_SQL);
    let row = connection
        .query_row_as::<(String, String, String, u64, u32, String, String)>(DATABASE_SQL, &[])?;
    let (log_mode, supplemental_log_data_min, endian_format, current_scn, resetlogs_id, banner, db_name) =
        row;
    Ok(DatabaseAttributes {
        log_mode,
        supplemental_log_data_min,
        endian_format,
        current_scn,
        resetlogs_id,
        banner,
        db_name,
    })
}

fn container_id(connector: &mut Connector) -> Result<u32> {
    let connection = connector.ensure_connected()?;
    debug!("{}", CON_ID_SQL);
    let raw = connection.query_row_as::<String>(CON_ID_SQL, &[])?;
    raw.parse()
        .map_err(|_| Error::BadDictionaryValue(format!("CON_ID {raw}")))
}

fn current_sequence(connector: &mut Connector) -> Result<u32> {
    let connection = connector.ensure_connected()?;
    debug!("{}", CURRENT_SEQUENCE_SQL);
    Ok(connection.query_row_as::<u32>(CURRENT_SEQUENCE_SQL, &[])?)
}

/// A checkpointed incarnation must match the live database; logs written
/// before a RESETLOGS recovery describe a timeline that no longer exists.
fn reconcile_incarnation(checkpoint: u32, current: u32) -> Result<u32> {
    if checkpoint != 0 && checkpoint != current {
        error!(
            "incorrect database incarnation, checkpoint resetlogs: {}, database resetlogs: {}",
            checkpoint, current
        );
        return Err(Error::IncarnationMismatch {
            checkpoint,
            current,
        });
    }
    Ok(current)
}

/// Packs `Release X.Y` from the version banner into hex digits, so 12.2
/// compares as 0x12200.
fn parse_version(banner: &str) -> Option<u32> {
    let release = banner.split("Release ").nth(1)?;
    let mut numbers = release.split('.');
    let major: u32 = numbers.next()?.trim().parse().ok()?;
    let minor: u32 = numbers.next()?.trim().parse().ok()?;
    Some(((major / 10) << 16) | ((major % 10) << 12) | (minor << 8))
}
