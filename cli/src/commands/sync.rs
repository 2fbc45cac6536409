use anyhow::{Result, bail};

use tally_core::TallyService;
use tally_core::models::RecordKind;

use super::helpers::print_sync_report;

/// Pull remote collections into the local store. Exits non-zero when any
/// report carries a failure, after printing every report.
pub(crate) async fn cmd_sync(service: &TallyService, kind: Option<RecordKind>, json: bool) -> Result<()> {
    let reports = match kind {
        Some(kind) => vec![service.repository(kind).sync().await],
        None => service.sync_all().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_sync_report(report);
        }
    }

    let failed = reports.iter().filter(|r| !r.is_clean()).count();
    if failed > 0 {
        bail!("sync finished with problems in {failed} collection(s)");
    }
    Ok(())
}
