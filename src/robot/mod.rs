//! Robot and media-changer control: mounting and dismounting cartridges
//! through whichever loader serves the drive.

pub mod acs;
pub mod element_status;
pub mod rmc;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::robot::element_status::{vid_in_drive, ElementStatus};

/// Delay before a fast retry of a failed mount/dismount.
pub const FAST_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Delay before a slow retry; the drive is released in between.
pub const SLOW_RETRY_DELAY: Duration = Duration::from_secs(600);
/// Attempts of the element-status re-check after a busy response.
pub const BUSY_RECHECK_ATTEMPTS: u32 = 3;

/// Media-changer daemon status codes, as the decision table knows them.
pub const RMC_NORETRY: u32 = 1;
pub const RMC_SLOW_RETRY: u32 = 2;
pub const RMC_FAST_RETRY: u32 = 3;
pub const RMC_DMNT_FORCE: u32 = 4;
pub const RMC_CONF_DRV_DN: u32 = 5;
/// "Volume in use" as reported by one vendor's media changer. The value is
/// a heuristic, not a verified cross-vendor contract; it earns the
/// element-status re-check before the error is believed.
pub const RMC_VOLUME_IN_USE: u32 = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RobotError {
    /// The loader specification in the drive configuration is unparsable.
    #[error("unparsable loader specification: {0}")]
    Loader(String),

    /// The media changer refused or failed the operation.
    #[error("media changer error {code}: {message}")]
    MediaChanger { code: u32, message: String },

    /// The transport to the robot broke.
    #[error("communication error with the media changer: {0}")]
    Communication(String),
}

/// What the caller should do about a failed mount/dismount.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryAction {
    /// Give up.
    NoRetry,
    /// Retry after [`FAST_RETRY_DELAY`].
    FastRetry,
    /// Release the drive and retry after [`SLOW_RETRY_DELAY`].
    SlowRetry,
    /// Retry the dismount with the force flag.
    DismountForce,
    /// Take the drive out of service.
    ConfigureDriveDown,
}

/// The fixed decision table from media-changer status codes to retry
/// behavior.
pub fn retry_action(code: u32) -> RetryAction {
    match code {
        RMC_FAST_RETRY => RetryAction::FastRetry,
        RMC_SLOW_RETRY => RetryAction::SlowRetry,
        RMC_DMNT_FORCE => RetryAction::DismountForce,
        RMC_CONF_DRV_DN => RetryAction::ConfigureDriveDown,
        // "volume in use": not semantically stable across vendors, treated
        // as worth a slow retry once the re-check has not cleared it
        RMC_VOLUME_IN_USE => RetryAction::SlowRetry,
        _ => RetryAction::NoRetry,
    }
}

/// The loader serving a drive, parsed from the drive's loader
/// specification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Loader {
    /// An ACS robot; the target string is the vendor drive address.
    Acs { target: String },
    /// An operator mounts by hand.
    Manual,
    /// A SCSI media changer behind the media-changer daemon on `host`.
    Smc { host: String, drive_ordinal: u16 },
}

impl Loader {
    pub fn parse(spec: &str) -> Result<Loader, RobotError> {
        if spec == "manual" {
            return Ok(Loader::Manual);
        }
        if let Some(target) = spec.strip_prefix("acs@") {
            if target.is_empty() {
                return Err(RobotError::Loader(spec.to_string()));
            }
            return Ok(Loader::Acs {
                target: target.to_string(),
            });
        }
        if let Some(rest) = spec.strip_prefix("smc@") {
            let (host, ordinal) = rest
                .split_once(',')
                .ok_or_else(|| RobotError::Loader(spec.to_string()))?;
            if host.is_empty() {
                return Err(RobotError::Loader(spec.to_string()));
            }
            let drive_ordinal = ordinal
                .parse::<u16>()
                .map_err(|_| RobotError::Loader(spec.to_string()))?;
            return Ok(Loader::Smc {
                host: host.to_string(),
                drive_ordinal,
            });
        }
        Err(RobotError::Loader(spec.to_string()))
    }
}

/// Seam to the media-changer daemon, so the busy re-check logic is
/// independent of the wire client.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MediaChanger: Send + Sync {
    async fn move_to_drive(&self, vid: &str, drive_ordinal: u16) -> Result<(), RobotError>;
    async fn move_from_drive(
        &self,
        vid: &str,
        drive_ordinal: u16,
        force: bool,
    ) -> Result<(), RobotError>;
    async fn read_element_status(&self, vid: &str) -> Result<Vec<ElementStatus>, RobotError>;
}

/// Mount/dismount through a SCSI media changer, with the bounded re-check
/// for libraries that report transient busy even when the operation
/// actually went through.
pub struct SmcRobot {
    changer: Arc<dyn MediaChanger>,
    recheck_delay: Duration,
}

impl SmcRobot {
    pub fn new(changer: Arc<dyn MediaChanger>) -> SmcRobot {
        SmcRobot {
            changer,
            recheck_delay: Duration::from_secs(1),
        }
    }

    pub fn with_recheck_delay(changer: Arc<dyn MediaChanger>, recheck_delay: Duration) -> SmcRobot {
        SmcRobot {
            changer,
            recheck_delay,
        }
    }

    pub async fn mount(&self, vid: &str, drive_ordinal: u16) -> Result<(), RobotError> {
        match self.changer.move_to_drive(vid, drive_ordinal).await {
            Ok(()) => {
                info!(vid, drive_ordinal, "mounted");
                Ok(())
            }
            Err(RobotError::MediaChanger { code, message }) if code == RMC_VOLUME_IN_USE => {
                warn!(vid, code, detail = %message, "library reports busy, re-checking element status");
                self.recheck_after_busy(vid, RobotError::MediaChanger { code, message })
                    .await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn dismount(&self, vid: &str, drive_ordinal: u16, force: bool) -> Result<(), RobotError> {
        self.changer.move_from_drive(vid, drive_ordinal, force).await?;
        info!(vid, drive_ordinal, force, "dismounted");
        Ok(())
    }

    /// Some libraries report "volume in use" for an operation that in fact
    /// succeeded. Before believing the error, look at the physical element
    /// status a bounded number of times.
    async fn recheck_after_busy(
        &self,
        vid: &str,
        original: RobotError,
    ) -> Result<(), RobotError> {
        for attempt in 1..=BUSY_RECHECK_ATTEMPTS {
            tokio::time::sleep(self.recheck_delay).await;
            match self.changer.read_element_status(vid).await {
                Ok(statuses) => {
                    if vid_in_drive(&statuses, vid) {
                        info!(vid, attempt, "cartridge is in the drive after all");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(vid, attempt, error = %e, "element status read failed during re-check");
                }
            }
        }
        Err(original)
    }
}

/// Dispatches mount/dismount to whatever the drive's loader is.
pub struct RobotControl {
    smc: SmcRobot,
    acs: acs::AcsRobot,
}

impl RobotControl {
    pub fn new(smc: SmcRobot, acs: acs::AcsRobot) -> RobotControl {
        RobotControl { smc, acs }
    }

    pub async fn mount(&self, vid: &str, loader: &Loader) -> Result<(), RobotError> {
        match loader {
            Loader::Manual => {
                info!(vid, "manual loader: waiting for the operator is the caller's business");
                Ok(())
            }
            Loader::Acs { target } => self.acs.mount(vid, target).await,
            Loader::Smc { drive_ordinal, .. } => self.smc.mount(vid, *drive_ordinal).await,
        }
    }

    pub async fn dismount(&self, vid: &str, loader: &Loader, force: bool) -> Result<(), RobotError> {
        match loader {
            Loader::Manual => Ok(()),
            Loader::Acs { target } => self.acs.dismount(vid, target, force).await,
            Loader::Smc { drive_ordinal, .. } => {
                self.smc.dismount(vid, *drive_ordinal, force).await
            }
        }
    }
}
