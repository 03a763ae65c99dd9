// src/drivers/git_submodule.rs

//! Git submodules are reported as packages; their content already arrived
//! with the source checkout.

use std::path::Path;
use tracing::debug;

use super::{DriverContext, LockfileDriver, Resolution, StagedPackage, StoreAccess};
use crate::emit::RuntimeConfig;
use crate::error::Result;
use crate::model::{PackageManager, PackageRecord, PackageType};

pub struct GitSubmoduleDriver;

impl LockfileDriver for GitSubmoduleDriver {
    fn manager(&self) -> PackageManager {
        PackageManager::GitSubmodule
    }

    fn resolve(&self, ctx: &DriverContext<'_>, _subpath: &Path) -> Result<Resolution> {
        let mut resolution = Resolution::new(Path::new(""));
        for submodule in ctx.git.submodules(&ctx.source_root())? {
            debug!(
                "Submodule {} at {} is {}#{}",
                submodule.name, submodule.path, submodule.url, submodule.commit
            );
            resolution.packages.push(PackageRecord::new(
                PackageType::GitSubmodule,
                submodule.name,
                format!("{}#{}", submodule.url, submodule.commit),
                submodule.path,
            ));
        }
        Ok(resolution)
    }

    fn runtime_config(
        &self,
        _ctx: &DriverContext<'_>,
        _staged: &[StagedPackage],
        _access: Option<&StoreAccess>,
    ) -> Result<RuntimeConfig> {
        Ok(RuntimeConfig::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing::Fixture;

    #[test]
    fn test_no_submodules() {
        let fx = Fixture::new(PackageManager::GitSubmodule);
        let resolution = GitSubmoduleDriver.resolve(&fx.ctx(), Path::new(".")).unwrap();
        assert!(resolution.packages.is_empty());
        assert!(resolution.jobs.is_empty());
    }
}
