//! OVA archives: a tar of the descriptor, its manifest and the disks,
//! in that order.

use crate::error::{VcenterError, VcenterResult};

use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Files extracted from an OVA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvaContents {
    pub ovf_path: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Write `ova_path` from an exported descriptor, optional manifest and disks.
pub async fn pack(ova_path: &Path, ovf: &Path, manifest: Option<&Path>, disks: &[PathBuf]) -> VcenterResult<()> {
    let mut members = vec![ovf.to_path_buf()];
    members.extend(manifest.map(Path::to_path_buf));
    members.extend(disks.iter().cloned());
    let ova_path = ova_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> VcenterResult<()> {
        let mut builder = tar::Builder::new(File::create(&ova_path)?);
        for member in &members {
            let name = member
                .file_name()
                .ok_or_else(|| VcenterError::config(format!("Not a file path: {}", member.display())))?;
            builder.append_path_with_name(member, name)?;
            debug!("Packed {} into {}", member.display(), ova_path.display());
        }
        builder.into_inner()?.sync_all()?;
        Ok(())
    })
    .await?
}

/// Extract an OVA into `dest`. Entries that would land outside `dest`
/// are skipped.
pub async fn unpack(ova_path: &Path, dest: &Path) -> VcenterResult<OvaContents> {
    let ova_path = ova_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> VcenterResult<OvaContents> {
        std::fs::create_dir_all(&dest)?;
        let mut archive = tar::Archive::new(File::open(&ova_path)?);
        let mut files = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();
            if entry.unpack_in(&dest)? {
                files.push(dest.join(&rel));
            } else {
                warn!("Skipped OVA entry outside the target directory: {}", rel.display());
            }
        }
        let ovf_path = files
            .iter()
            .find(|p| p.extension().is_some_and(|e| e == "ovf"))
            .cloned()
            .ok_or_else(|| VcenterError::parse(format!("No .ovf descriptor in {}", ova_path.display())))?;
        Ok(OvaContents { ovf_path, files })
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pack_orders_descriptor_manifest_disks() {
        let dir = tempfile::tempdir().unwrap();
        let ovf = dir.path().join("vm.ovf");
        let mf = dir.path().join("vm-brkt.mf");
        let disk = dir.path().join("vm-disk1.vmdk");
        std::fs::write(&ovf, "<Envelope/>").unwrap();
        std::fs::write(&mf, "{\"vm-disk1.vmdk\": \"00\"}").unwrap();
        std::fs::write(&disk, vec![1u8; 2048]).unwrap();

        let ova = dir.path().join("vm.ova");
        pack(&ova, &ovf, Some(&mf), &[disk]).await.unwrap();

        let mut archive = tar::Archive::new(File::open(&ova).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["vm.ovf", "vm-brkt.mf", "vm-disk1.vmdk"]);

        let out = dir.path().join("out");
        let contents = unpack(&ova, &out).await.unwrap();
        assert_eq!(contents.ovf_path, out.join("vm.ovf"));
        assert_eq!(contents.files.len(), 3);
        assert_eq!(std::fs::read(out.join("vm-disk1.vmdk")).unwrap(), vec![1u8; 2048]);
    }

    #[tokio::test]
    async fn archive_without_descriptor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.vmdk");
        std::fs::write(&disk, b"x").unwrap();
        let ova = dir.path().join("bad.ova");
        {
            let mut builder = tar::Builder::new(File::create(&ova).unwrap());
            builder.append_path_with_name(&disk, "disk.vmdk").unwrap();
            builder.finish().unwrap();
        }
        let err = unpack(&ova, &dir.path().join("out")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::VcenterErrorKind::ParseError);
    }
}
