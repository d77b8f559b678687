//! Firmware package loading.
//!
//! A package is a zip archive holding an init packet (`.dat`) and the
//! firmware image (`.bin`). Nordic-style archives name both in
//! `manifest.json`; bare archives are scanned by file name instead.

use anyhow::{Context, Result, anyhow};
use std::io::prelude::*;

pub struct FirmwarePackage {
    pub init_data: Vec<u8>,
    pub image_data: Vec<u8>,
}

pub fn load(path: &str) -> Result<FirmwarePackage> {
    let reader = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    from_reader(reader)
}

pub fn from_reader<R: Read + Seek>(reader: R) -> Result<FirmwarePackage> {
    let mut zip = zip::ZipArchive::new(reader)?;

    let (dat_name, bin_name) = match manifest_entries(&mut zip)? {
        Some(names) => names,
        None => scan_entries(&zip)?,
    };

    let init_data = read_entry(&mut zip, &dat_name)?;
    let image_data = read_entry(&mut zip, &bin_name)?;
    anyhow::ensure!(!image_data.is_empty(), "firmware image `{bin_name}` is empty");

    Ok(FirmwarePackage {
        init_data,
        image_data,
    })
}

fn manifest_entries<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
) -> Result<Option<(String, String)>> {
    let manifest: serde_json::Value = match zip.by_name("manifest.json") {
        Ok(raw) => serde_json::from_reader(raw).context("DFU package: invalid manifest.json")?,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let application = &manifest["manifest"]["application"];
    anyhow::ensure!(
        application.is_object(),
        "DFU package: missing component `application`"
    );
    let dat = application["dat_file"]
        .as_str()
        .ok_or(anyhow!("DFU package: invalid manifest"))?;
    let bin = application["bin_file"]
        .as_str()
        .ok_or(anyhow!("DFU package: invalid manifest"))?;

    Ok(Some((dat.to_string(), bin.to_string())))
}

fn scan_entries<R: Read + Seek>(zip: &zip::ZipArchive<R>) -> Result<(String, String)> {
    let mut dat = None;
    let mut bin = None;
    for name in zip.file_names() {
        if dat.is_none() && name.contains(".dat") {
            dat = Some(name.to_string());
        } else if bin.is_none() && name.contains(".bin") {
            bin = Some(name.to_string());
        }
    }
    Ok((
        dat.context("DFU package: no `.dat` entry")?,
        bin.context("DFU package: no `.bin` entry")?,
    ))
}

fn read_entry<R: Read + Seek>(zip: &mut zip::ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut reader = zip
        .by_name(name)
        .with_context(|| format!("DFU package: missing entry `{name}`"))?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn loads_a_bare_archive_by_file_name() {
        let zip = build_zip(&[
            ("firmware.dat", &[1, 2]),
            ("firmware.bin", &[3, 4, 5]),
        ]);
        let package = from_reader(zip).unwrap();
        assert_eq!(package.init_data, vec![1, 2]);
        assert_eq!(package.image_data, vec![3, 4, 5]);
    }

    #[test]
    fn manifest_names_win_over_scanning() {
        let manifest = br#"{
            "manifest": {
                "application": { "dat_file": "app.dat", "bin_file": "app.bin" }
            }
        }"#;
        let zip = build_zip(&[
            ("manifest.json", manifest.as_slice()),
            ("other.dat", &[9]),
            ("app.dat", &[1]),
            ("app.bin", &[2, 3]),
        ]);
        let package = from_reader(zip).unwrap();
        assert_eq!(package.init_data, vec![1]);
        assert_eq!(package.image_data, vec![2, 3]);
    }

    #[test]
    fn rejects_an_archive_without_an_image() {
        let zip = build_zip(&[("firmware.dat", &[1, 2])]);
        assert!(from_reader(zip).is_err());
    }

    #[test]
    fn rejects_an_empty_image() {
        let zip = build_zip(&[("firmware.dat", &[1]), ("firmware.bin", &[])]);
        assert!(from_reader(zip).is_err());
    }
}
