//! End-to-end dispatcher scenarios, exercised the way `spec.md` §8 lays out
//! its worked examples: build a framed request, run it through [`dispatch`],
//! and check the framed response.

use std::path::{Path, PathBuf};

use tempfile::tempdir;

use w64fsd::cache::{ImageParseCache, UsageCache};
use w64fsd::config::{Config, GlobalPolicy, Limits, TokenConfig};
use w64fsd::dispatch::{self, ServerState};
use w64fsd::image::ops as img_ops;
use w64fsd::image::{CbmFileType, ImageKind};
use w64fsd::lock::WriteLock;
use w64fsd::policy::Policy;
use w64fsd::wire::opcode::{features, flags as flag_bits, Opcode};
use w64fsd::wire::{Cursor, Writer};

fn policy_for(root: &Path) -> Policy {
    Policy {
        root: root.to_path_buf(),
        display_name: None,
        read_only: false,
        quota_bytes: 0,
        per_file_cap: 0,
        disk_images_enabled: true,
        disk_images_write_enabled: true,
        disk_images_auto_resize_enabled: false,
        disk_images_allow_rename_convert: false,
        trash_enabled: false,
        trash_dir: ".TRASH".to_string(),
        overwrite_enabled: true,
        errmsg_enabled: true,
        mkdir_parents_enabled: true,
        rmdir_recursive_enabled: true,
        cp_recursive_enabled: true,
    }
}

fn cfg_for(root: &Path) -> Config {
    let mut tokens = std::collections::HashMap::new();
    tokens.insert(
        "tok".to_string(),
        TokenConfig {
            root: root.to_path_buf(),
            display_name: None,
            read_only: false,
            quota_bytes: 0,
            per_file_cap: 0,
            disk_images_enabled: true,
            disk_images_write_enabled: true,
            disk_images_auto_resize_enabled: false,
            disk_images_allow_rename_convert: false,
            trash_enabled: false,
            trash_dir: ".TRASH".to_string(),
            overwrite_enabled: true,
            errmsg_enabled: true,
            mkdir_parents_enabled: true,
            rmdir_recursive_enabled: true,
            cp_recursive_enabled: true,
        },
    );
    Config {
        server_name: "w64fsd-test".to_string(),
        listen_addr: String::new(),
        endpoint_path: String::new(),
        limits: Limits::default(),
        global_policy: GlobalPolicy::default(),
        tokens,
        prg_fallback_enabled: true,
        prg_fallback_read_enabled: true,
    }
}

fn state() -> ServerState {
    ServerState { write_lock: WriteLock::new(), usage_cache: UsageCache::new(), image_cache: ImageParseCache::new() }
}

fn path_payload(path: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.string(path);
    w.into_vec()
}

#[test]
fn caps_response_leads_with_limits() {
    let dir = tempdir().unwrap();
    let cfg = cfg_for(dir.path());
    let policy = policy_for(dir.path());
    let st = state();

    let out = dispatch::dispatch(&st, &cfg, &policy, Opcode::Caps, 0, &[]).unwrap();
    let mut cur = Cursor::new(&out);
    assert_eq!(cur.u16().unwrap(), cfg.limits.max_chunk);
    assert_eq!(cur.u16().unwrap(), cfg.limits.max_payload);
}

#[test]
fn ls_lists_written_host_files() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("README.TXT"), b"hi").unwrap();
    let cfg = cfg_for(dir.path());
    let policy = policy_for(dir.path());
    let st = state();

    let mut payload = path_payload("/");
    let mut w = Writer::new();
    w.u16(0).u16(100);
    payload.extend_from_slice(&w.into_vec());

    let out = dispatch::dispatch(&st, &cfg, &policy, Opcode::Ls, 0, &payload).unwrap();
    let mut cur = Cursor::new(&out);
    let count = cur.u16().unwrap();
    assert_eq!(count, 1);
    let is_dir = cur.u8().unwrap();
    let _size = cur.u32().unwrap();
    let _mtime = cur.u32().unwrap();
    let name = cur.string().unwrap();
    assert_eq!(is_dir, 0);
    assert_eq!(name, "README.TXT");
}

#[test]
fn sandbox_resolve_rejects_symlink_escape() {
    let dir = tempdir().unwrap();
    let outside = tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), b"nope").unwrap();
    std::os::unix::fs::symlink(outside.path(), dir.path().join("LINK")).unwrap();

    let normalized = w64fsd::path::normalize("/LINK/secret.txt", 1024, 255, false).unwrap();
    let result = w64fsd::sandbox::resolve(dir.path(), &normalized);
    assert!(result.is_err(), "resolving through a symlink must be rejected");
}

fn d64_with_file(dir: &Path, file_name: &str, bytes: &[u8], file_type: CbmFileType) -> PathBuf {
    let image_path = dir.join("DISK.D64");
    let data = img_ops::format_empty(ImageKind::D64, "TESTDISK", "2A");
    std::fs::write(&image_path, &data).unwrap();

    let cache = ImageParseCache::new();
    let loaded = img_ops::load(&cache, &image_path, ImageKind::D64).unwrap();
    let segments = vec![file_name.to_string()];
    img_ops::apply_mutation(
        &cache,
        &image_path,
        ImageKind::D64,
        &loaded,
        img_ops::Mutation::Put { segments: &segments, file_type, bytes: bytes.to_vec() },
    )
    .unwrap();
    image_path
}

#[test]
fn hash_of_in_image_file_matches_crc32_of_its_bytes() {
    let dir = tempdir().unwrap();
    let content = b"HELLO FROM A C64 PROGRAM";
    d64_with_file(dir.path(), "GAME.PRG", content, CbmFileType::Prg);

    let cfg = cfg_for(dir.path());
    let policy = policy_for(dir.path());
    let st = state();

    let payload = path_payload("/DISK.D64/GAME.PRG");
    let out = dispatch::dispatch(&st, &cfg, &policy, Opcode::Hash, 0, &payload).unwrap();
    let mut cur = Cursor::new(&out);
    let crc = cur.u32().unwrap();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content);
    assert_eq!(crc, hasher.finalize());
}

#[test]
fn prg_fallback_read_serves_dot_prg_when_extensionless_name_requested() {
    let dir = tempdir().unwrap();
    let content = b"FALLBACK CONTENT";
    d64_with_file(dir.path(), "GAME.PRG", content, CbmFileType::Prg);

    let cfg = cfg_for(dir.path());
    let policy = policy_for(dir.path());
    let st = state();

    let mut payload = path_payload("/DISK.D64/GAME");
    let mut w = Writer::new();
    w.u32(0).u16(content.len() as u16);
    payload.extend_from_slice(&w.into_vec());

    let out = dispatch::dispatch(&st, &cfg, &policy, Opcode::ReadRange, 0, &payload).unwrap();
    assert_eq!(out, content);
}

#[test]
fn rm_diverts_to_trash_when_enabled() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("DOOMED.TXT"), b"bye").unwrap();

    let cfg = cfg_for(dir.path());
    let mut policy = policy_for(dir.path());
    policy.trash_enabled = true;
    let st = state();

    let payload = path_payload("/DOOMED.TXT");
    dispatch::dispatch(&st, &cfg, &policy, Opcode::Rm, 0, &payload).unwrap();

    assert!(!dir.path().join("DOOMED.TXT").exists());
    let trash_root = dir.path().join(".TRASH");
    assert!(trash_root.is_dir());
    let found = walk_for_name(&trash_root, "DOOMED.TXT");
    assert!(found, "deleted file should reappear somewhere under .TRASH");
}

fn walk_for_name(dir: &Path, name: &str) -> bool {
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            return true;
        }
        if path.is_dir() && walk_for_name(&path, name) {
            return true;
        }
    }
    false
}

#[test]
fn mkdir_then_rmdir_recursive_removes_contents() {
    let dir = tempdir().unwrap();
    let cfg = cfg_for(dir.path());
    let policy = policy_for(dir.path());
    let st = state();

    dispatch::dispatch(&st, &cfg, &policy, Opcode::Mkdir, 0, &path_payload("/SUB")).unwrap();
    std::fs::write(dir.path().join("SUB/FILE.TXT"), b"x").unwrap();

    let err = dispatch::dispatch(&st, &cfg, &policy, Opcode::Rmdir, 0, &path_payload("/SUB")).unwrap_err();
    assert_eq!(err.status(), w64fsd::status::Status::DirNotEmpty);

    dispatch::dispatch(&st, &cfg, &policy, Opcode::Rmdir, flag_bits::RMDIR_RECURSIVE, &path_payload("/SUB"))
        .unwrap();
    assert!(!dir.path().join("SUB").exists());
}

#[test]
fn caps_omits_disabled_feature_bits_and_handlers_reject_them() {
    let dir = tempdir().unwrap();
    let cfg = cfg_for(dir.path());
    let mut policy = policy_for(dir.path());
    policy.mkdir_parents_enabled = false;
    policy.rmdir_recursive_enabled = false;
    policy.cp_recursive_enabled = false;
    let st = state();

    let out = dispatch::dispatch(&st, &cfg, &policy, Opcode::Caps, 0, &[]).unwrap();
    let mut cur = Cursor::new(&out);
    cur.u16().unwrap(); // max_chunk
    cur.u16().unwrap(); // max_payload
    cur.u16().unwrap(); // max_path
    cur.u16().unwrap(); // max_name
    cur.u16().unwrap(); // max_entries
    let feature_bits = cur.u32().unwrap();
    assert_eq!(feature_bits & features::MKDIR_PARENTS, 0);
    assert_eq!(feature_bits & features::RMDIR_RECURSIVE, 0);
    assert_eq!(feature_bits & features::CP_RECURSIVE, 0);

    std::fs::create_dir(dir.path().join("SUB")).unwrap();
    std::fs::write(dir.path().join("SUB/FILE.TXT"), b"x").unwrap();

    let err = dispatch::dispatch(
        &st,
        &cfg,
        &policy,
        Opcode::Mkdir,
        flag_bits::MKDIR_PARENTS,
        &path_payload("/A/B"),
    )
    .unwrap_err();
    assert_eq!(err.status(), w64fsd::status::Status::NotSupported);

    let err = dispatch::dispatch(
        &st,
        &cfg,
        &policy,
        Opcode::Rmdir,
        flag_bits::RMDIR_RECURSIVE,
        &path_payload("/SUB"),
    )
    .unwrap_err();
    assert_eq!(err.status(), w64fsd::status::Status::NotSupported);
    assert!(dir.path().join("SUB").exists(), "rejected RMDIR must not touch the directory");

    std::fs::create_dir(dir.path().join("SRCDIR")).unwrap();
    let mut payload = Writer::new();
    payload.string("/SRCDIR");
    let mut p = payload.into_vec();
    let mut w = Writer::new();
    w.string("/DSTDIR");
    p.extend_from_slice(&w.into_vec());
    let err =
        dispatch::dispatch(&st, &cfg, &policy, Opcode::Cp, flag_bits::CP_RECURSIVE, &p).unwrap_err();
    assert_eq!(err.status(), w64fsd::status::Status::NotSupported);
}

#[test]
fn quota_precheck_ignores_fixed_size_image_writes() {
    let dir = tempdir().unwrap();
    d64_with_file(dir.path(), "EXISTING.PRG", b"0123456789", CbmFileType::Prg);
    let image_len = std::fs::metadata(dir.path().join("DISK.D64")).unwrap().len();

    let cfg = cfg_for(dir.path());
    let mut policy = policy_for(dir.path());
    // A quota only just big enough for the image file itself: writing a new
    // file *into* the image must not charge its logical byte count against
    // this quota, since the D64 container doesn't grow on disk.
    policy.quota_bytes = image_len;
    let st = state();

    let mut payload = path_payload("/DISK.D64/NEW.PRG");
    let mut w = Writer::new();
    w.u16(5);
    payload.extend_from_slice(&w.into_vec());
    payload.extend_from_slice(b"hello");

    let out = dispatch::dispatch(
        &st,
        &cfg,
        &policy,
        Opcode::Append,
        flag_bits::APPEND_CREATE,
        &payload,
    );
    assert!(out.is_ok(), "append into a fixed-size image must not over-count quota: {out:?}");
}
