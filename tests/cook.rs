use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use fs_err as fs;
use pretty_assertions::assert_eq;
use recook::asset_registry::AssetRegistry;
use recook::chunk_manifest::ChunkDependencyTree;
use recook::logging::Log;
use recook::manifest::ChunkManifestFile;
use recook::platform::Platforms;
use recook::project::ProjectRepository;
use recook::repository::AssetRepository as _;
use recook::sandbox::{MetadataFile, Sandbox, decode_cooked};
use recook::scheduler::{CookOptions, Cooker};
use recook::settings::CookSettings;
use recook::{ChunkId, TargetPlatform};

fn write_project(dir: &Path, hero_modified: u64) -> Result<std::path::PathBuf> {
    fs::create_dir_all(dir.join("Content"))?;
    fs::write(dir.join("Content/Hero.bin"), b"hero\0editor only")?;
    let project = format!(
        r#"{{
            "name": "Arena",
            "content_dir": "Content",
            "startup_packages": ["/Game/Sword"],
            "assets": [
                {{ "name": "/Game/Maps/Arena", "class": "World", "hard": ["/Game/Hero"], "chunks": [1], "modified": 100 }},
                {{ "name": "/Game/Hero", "source": "Hero.bin", "soft": ["/Game/Sword"], "modified": {hero_modified} }},
                {{ "name": "/Game/Sword", "modified": 100 }},
                {{ "name": "/Game/Unused", "modified": 100 }}
            ]
        }}"#
    );
    let path = dir.join("project.json");
    fs::write(&path, project)?;
    Ok(path)
}

fn chunk_tree() -> Result<ChunkDependencyTree> {
    let mut tree = ChunkDependencyTree::new();
    tree.set_parent(ChunkId(1), Some(ChunkId(0)))?;
    Ok(tree)
}

fn cook(project: &Path, sandbox: &Path, iterative: bool) -> Result<Cooker<ProjectRepository>> {
    let options = CookOptions {
        iterative,
        compressed: true,
        chunk_tree: chunk_tree()?,
        ..Default::default()
    };
    let mut cooker = Cooker::new(
        ProjectRepository::load(project)?,
        Platforms::from_names(&["Windows", "WindowsEditor"])?,
        Sandbox::open(sandbox)?,
        CookSettings::default(),
        options,
        Log::quiet(),
    );
    cooker.start(&[])?;
    cooker.run_to_completion()?;
    Ok(cooker)
}

fn chunk_packages(manifest: &ChunkManifestFile, chunk: u32) -> BTreeSet<String> {
    manifest.chunks.get(&ChunkId(chunk)).into_iter().flatten().map(|e| e.package.clone()).collect()
}

#[test]
fn test_cook_writes_artifacts_and_manifests() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let project = write_project(dir.path(), 100)?;
    let sandbox_dir = dir.path().join("Saved/Cooked");
    let cooker = cook(&project, &sandbox_dir, false)?;
    assert_eq!(cooker.stats().cooked, 4);
    assert_eq!(cooker.stats().failed, 0);

    let sandbox = cooker.sandbox();
    let windows = TargetPlatform::from_name("Windows");
    let editor = TargetPlatform::from_name("WindowsEditor");
    let hero = Sandbox::cooked_path("/Game/Hero", false);
    let (_, payload) = decode_cooked(&fs::read(sandbox.full_path(&windows, &hero))?)?;
    assert_eq!(payload, b"hero".to_vec());
    let (_, payload) = decode_cooked(&fs::read(sandbox.full_path(&editor, &hero))?)?;
    assert_eq!(payload, b"hero\0editor only".to_vec());
    assert!(sandbox.full_path(&windows, &Sandbox::cooked_path("/Game/Maps/Arena", true)).exists());

    let manifest: ChunkManifestFile = serde_json::from_slice(&sandbox.read_metadata(&windows, MetadataFile::ChunkManifest)?.unwrap())?;
    assert_eq!(manifest.platform, "Windows");
    assert_eq!(chunk_packages(&manifest, 0), BTreeSet::from(["/Game/Sword".to_string(), "/Game/Unused".to_string()]));
    assert_eq!(chunk_packages(&manifest, 1), BTreeSet::from(["/Game/Hero".to_string(), "/Game/Maps/Arena".to_string()]));

    let registry = AssetRegistry::read(&mut std::io::Cursor::new(sandbox.read_metadata(&windows, MetadataFile::AssetRegistry)?.unwrap()))?;
    assert_eq!(registry.assets.len(), 4);
    assert_eq!(registry.get("/game/maps/arena").unwrap().chunk_ids, vec![ChunkId(1)]);
    assert!(registry.get("/Game/Hero").unwrap().cooked_hash.is_some());
    Ok(())
}

#[test]
fn test_iterative_cook_only_redoes_changed_closure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sandbox_dir = dir.path().join("Saved/Cooked");
    let project = write_project(dir.path(), 100)?;
    assert_eq!(cook(&project, &sandbox_dir, true)?.stats().cooked, 4);

    let unchanged = cook(&project, &sandbox_dir, true)?;
    assert_eq!(unchanged.stats().cooked, 0);

    // hero changes after everything was cooked, the map hard depends on it
    let future = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)? + Duration::from_secs(24 * 3600);
    let project = write_project(dir.path(), future.as_secs())?;
    let changed = cook(&project, &sandbox_dir, true)?;
    assert_eq!(changed.stats().cooked, 2);
    let id = |n: &str| changed.repo().names().find(n).unwrap();
    let windows = recook::PlatformId(0);
    for name in ["/Game/Hero", "/Game/Maps/Arena", "/Game/Sword", "/Game/Unused"] {
        assert!(changed.cooked().succeeded(id(name), windows), "{name}");
    }
    Ok(())
}

#[test]
fn test_cli_cook_exits_cleanly_with_failures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let project = dir.path().join("project.json");
    fs::write(
        &project,
        r#"{ "assets": [
            { "name": "/Game/Good", "modified": 1 },
            { "name": "/Game/Bad", "modified": 1, "fail_load": true }
        ] }"#,
    )?;
    let sandbox = dir.path().join("Cooked");
    let status = Command::new(env!("CARGO_BIN_EXE_recook"))
        .args(["cook", "--project"])
        .arg(&project)
        .arg("--sandbox")
        .arg(&sandbox)
        .args(["--platform", "Windows", "--platform", "PS3"])
        .status()?;
    assert!(status.success());
    assert!(sandbox.join("Windows/Content/Good.uasset").exists());
    assert!(sandbox.join("PS3/Content/Good.uasset").exists());
    assert!(!sandbox.join("Windows/Content/Bad.uasset").exists());
    assert!(sandbox.join("PS3/Metadata/AssetRegistry.bin").exists());

    let status = Command::new(env!("CARGO_BIN_EXE_recook"))
        .args(["cook", "--strict", "--project"])
        .arg(&project)
        .arg("--sandbox")
        .arg(&sandbox)
        .args(["--platform", "Windows", "--map", "/Game/Missing"])
        .status()?;
    assert!(!status.success());
    Ok(())
}
