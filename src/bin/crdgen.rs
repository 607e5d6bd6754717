// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CRD YAML Generator
//!
//! Generates Kubernetes CRD YAML files from the Rust types in src/crd.rs, so
//! the manifests under deploy/crds/ never drift from the code.
//!
//! Usage:
//!   cargo run --bin crdgen [OUTPUT_DIR]
//!
//! `OUTPUT_DIR` defaults to deploy/crds.

use kube::CustomResourceExt;
use std::fs;
use std::path::{Path, PathBuf};
use talos_operator::crd::{
    TalosAddon, TalosCluster, TalosClusterAddon, TalosClusterAddonRelease, TalosControlPlane,
    TalosEtcdBackup, TalosEtcdBackupSchedule, TalosMachine, TalosWorker,
};

const COPYRIGHT_HEADER: &str = "# Copyright (c) 2025 Erick Bourgeois, firestoned
# SPDX-License-Identifier: MIT
#
# This file is AUTO-GENERATED from src/crd.rs
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen` to regenerate
#
";

const DEFAULT_OUTPUT_DIR: &str = "deploy/crds";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR), PathBuf::from);

    println!("Generating CRD YAML files from src/crd.rs...");

    let written = generate_all(&output_dir)?;
    for filename in &written {
        println!("  ✓ Generated {filename}");
    }

    println!("✓ Successfully generated CRD YAML files in {}", output_dir.display());
    println!("\nNext steps:");
    println!("  1. Review the generated files");
    println!("  2. Deploy with: kubectl apply -f {}", output_dir.display());

    Ok(())
}

/// Writes every CRD into `output_dir` and returns the file names written.
fn generate_all(output_dir: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;

    Ok(vec![
        generate_crd::<TalosCluster>(output_dir)?,
        generate_crd::<TalosControlPlane>(output_dir)?,
        generate_crd::<TalosWorker>(output_dir)?,
        generate_crd::<TalosMachine>(output_dir)?,
        generate_crd::<TalosEtcdBackup>(output_dir)?,
        generate_crd::<TalosEtcdBackupSchedule>(output_dir)?,
        generate_crd::<TalosAddon>(output_dir)?,
        generate_crd::<TalosClusterAddon>(output_dir)?,
        generate_crd::<TalosClusterAddonRelease>(output_dir)?,
    ])
}

fn generate_crd<T>(output_dir: &Path) -> Result<String, Box<dyn std::error::Error>>
where
    T: CustomResourceExt,
{
    let crd = T::crd();
    let filename = format!("{}.crd.yaml", crd.spec.names.plural);

    let yaml = serde_yaml::to_string(&crd)?;
    let content = format!("{COPYRIGHT_HEADER}{yaml}");
    fs::write(output_dir.join(&filename), content)?;

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_all_writes_every_crd() {
        let dir = tempfile::tempdir().unwrap();

        let written = generate_all(dir.path()).unwrap();

        assert_eq!(written.len(), 9);
        assert!(written.contains(&"talosclusters.crd.yaml".to_string()));
        assert!(written.contains(&"talosclusteraddonreleases.crd.yaml".to_string()));
        assert!(written.contains(&"talosetcdbackupschedules.crd.yaml".to_string()));

        let content = fs::read_to_string(dir.path().join("talosmachines.crd.yaml")).unwrap();
        assert!(content.starts_with(COPYRIGHT_HEADER));
        assert!(content.contains("name: talosmachines.talos.alperen.cloud"));
        assert!(content.contains("kind: CustomResourceDefinition"));
    }

    #[test]
    fn test_generate_all_creates_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deploy").join("crds");

        generate_all(&nested).unwrap();

        assert!(nested.join("talosaddons.crd.yaml").exists());
    }
}
