//! The single entry point that decodes an opcode+flags+payload and routes
//! it to a host-filesystem or disk-image operation, enforcing policy gates
//! (`spec.md` §4.5 "Dispatcher").
//!
//! Mirrors the shape of the predecessor's `VfsTask`: one function taking a
//! decoded request and a resolved root/policy and returning a result, with
//! per-procedure parsing factored into small private helpers — except here
//! there is no async task boundary, since the whole HTTP body is already
//! buffered by the time this runs (see `crate::wire::codec`).

use std::path::{Path, PathBuf};

use crate::cache::{ImageParseCache, UsageCache};
use crate::config::{Config, Limits};
use crate::fs::{self, mtime_unix};
use crate::image::ops as img_ops;
use crate::image::{split_at_mount, CbmFileType, ImageKind};
use crate::lock::WriteLock;
use crate::path::{normalize, NormalizedPath};
use crate::policy::Policy;
use crate::sandbox;
use crate::status::{Error, Status};
use crate::trash;
use crate::wire::opcode::{features, flags as flag_bits};
use crate::wire::{Cursor, Opcode, Writer};

/// Process-wide state shared across every request: the write-exclusion
/// lock and the two caches (`spec.md` §5, §9 "Global state").
pub struct ServerState {
    pub write_lock: WriteLock,
    pub usage_cache: UsageCache,
    pub image_cache: ImageParseCache,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            write_lock: WriteLock::new(),
            usage_cache: UsageCache::new(),
            image_cache: ImageParseCache::new(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a normalized client path resolves to: a plain host path, or a
/// split across a disk-image mount boundary (`spec.md` §4.5).
enum Routed {
    Host(PathBuf),
    Image { image_abs: PathBuf, kind: ImageKind, inner: Vec<String> },
}

fn route(policy: &Policy, normalized: &NormalizedPath) -> Result<Routed, Error> {
    if policy.disk_images_enabled {
        if let Some(split) = split_at_mount(normalized) {
            let image_path = NormalizedPath::from_segments(&split.host_segments);
            let image_abs = sandbox::resolve(&policy.root, &image_path)?;
            return Ok(Routed::Image { image_abs, kind: split.kind, inner: split.inner_segments });
        }
    }
    let abs = sandbox::resolve(&policy.root, normalized)?;
    Ok(Routed::Host(abs))
}

fn read_path(cur: &mut Cursor, limits: &Limits, allow_wildcard: bool) -> Result<NormalizedPath, Error> {
    let raw = cur.string()?;
    normalize(&raw, limits.max_path as usize, limits.max_name as usize, allow_wildcard)
}

fn acquire_write(state: &ServerState) -> Result<crate::lock::WriteGuard<'_>, Error> {
    state.write_lock.try_acquire().ok_or(Error::Status(Status::Busy))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Cheap per-trash-entry collision-breaker; no `rand` crate in the stack
/// (the predecessor never needed one), and this value is only ever used
/// to disambiguate a trash id, not for anything security-sensitive.
fn rand4() -> u32 {
    let nanos =
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    nanos.subsec_nanos() ^ (std::process::id())
}

fn sandbox_relative(policy: &Policy, abs: &Path) -> String {
    match abs.strip_prefix(&policy.root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
        Err(_) => "/".to_string(),
    }
}

fn is_image_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.ends_with(".D64") || upper.ends_with(".D71") || upper.ends_with(".D81")
}

fn infer_cbm_type(name: &str) -> CbmFileType {
    let upper = name.to_ascii_uppercase();
    if upper.ends_with(".USR") {
        CbmFileType::Usr
    } else if upper.ends_with(".SEQ") {
        CbmFileType::Seq
    } else {
        CbmFileType::Prg
    }
}

fn derive_disk_name_id(path: &Path) -> (String, String) {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("DISK").to_ascii_uppercase();
    (stem.chars().take(16).collect(), "2A".to_string())
}

fn usage_for(state: &ServerState, policy: &Policy) -> Result<u64, Error> {
    if let Some(u) = state.usage_cache.get(&policy.root) {
        return Ok(u);
    }
    let u = fs::compute_usage(&policy.root)?;
    state.usage_cache.set(policy.root.clone(), u);
    Ok(u)
}

fn apply_usage_delta(state: &ServerState, policy: &Policy, delta: i64) {
    if delta != 0 && state.usage_cache.get(&policy.root).is_some() {
        state.usage_cache.apply_delta(&policy.root, delta);
    }
}

fn invalidate_usage(state: &ServerState, policy: &Policy) {
    state.usage_cache.invalidate(&policy.root);
}

/// Pre-checks the per-file cap (against `file_size`, the item's own
/// resulting size) and the root quota (against `quota_delta`, the signed
/// change in *host* bytes the write will cause) before any I/O happens
/// (`spec.md` §4.7). The two are distinct for disk-image writes: `file_size`
/// is the logical CBM file size, but D64/D71 images are fixed-size (the
/// write moves 0 host bytes) and D81's host-byte delta only falls out of
/// the repack plan - never assume `quota_delta == file_size`.
fn check_caps(policy: &Policy, state: &ServerState, file_size: u64, quota_delta: i64) -> Result<(), Error> {
    if policy.per_file_cap != 0 && file_size > policy.per_file_cap {
        return Err(Error::Status(Status::TooLarge));
    }
    if policy.quota_bytes != 0 && quota_delta > 0 {
        let used = usage_for(state, policy)?;
        if used as i64 + quota_delta > policy.quota_bytes as i64 {
            return Err(Error::Status(Status::TooLarge));
        }
    }
    Ok(())
}

/// Decodes `opcode`/`flags`/`payload` and executes the operation against
/// `policy`'s root, returning the response payload on success or a
/// [`Status`]-carrying [`Error`] on failure.
pub fn dispatch(
    state: &ServerState,
    cfg: &Config,
    policy: &Policy,
    opcode: Opcode,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    if opcode.is_write() && policy.read_only {
        return Err(Error::Status(Status::AccessDenied));
    }

    let mut cur = Cursor::new(payload);
    match opcode {
        Opcode::Caps => {
            cur.expect_exhausted()?;
            Ok(handle_caps(&cfg.limits, policy, &cfg.server_name))
        }
        Opcode::Ping => {
            cur.expect_exhausted()?;
            let mut w = Writer::new();
            w.string(&cfg.server_name);
            Ok(w.into_vec())
        }
        Opcode::Statfs => handle_statfs(&mut cur, cfg, policy, state),
        Opcode::Ls => handle_ls(&mut cur, cfg, policy, state),
        Opcode::Stat => handle_stat(&mut cur, cfg, policy, state),
        Opcode::ReadRange => handle_read_range(&mut cur, cfg, policy, state),
        Opcode::WriteRange => handle_write_range(&mut cur, flags, cfg, policy, state),
        Opcode::Append => handle_append(&mut cur, flags, cfg, policy, state),
        Opcode::Mkdir => handle_mkdir(&mut cur, flags, cfg, policy, state),
        Opcode::Rmdir => handle_rmdir(&mut cur, flags, cfg, policy, state),
        Opcode::Rm => handle_rm(&mut cur, cfg, policy, state),
        Opcode::Cp => handle_cp(&mut cur, flags, cfg, policy, state),
        Opcode::Mv => handle_mv(&mut cur, flags, cfg, policy, state),
        Opcode::Search => handle_search(&mut cur, flags, cfg, policy, state),
        Opcode::Hash => handle_hash(&mut cur, flags, cfg, policy, state),
    }
}

fn handle_caps(limits: &Limits, policy: &Policy, server_name: &str) -> Vec<u8> {
    let mut feature_bits = features::ALWAYS;
    if policy.mkdir_parents_enabled {
        feature_bits |= features::MKDIR_PARENTS;
    }
    if policy.rmdir_recursive_enabled {
        feature_bits |= features::RMDIR_RECURSIVE;
    }
    if policy.cp_recursive_enabled {
        feature_bits |= features::CP_RECURSIVE;
    }
    if policy.overwrite_enabled {
        feature_bits |= features::OVERWRITE;
    }
    if policy.errmsg_enabled {
        feature_bits |= features::ERRMSG;
    }
    let server_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);

    let mut w = Writer::new();
    w.u16(limits.max_chunk)
        .u16(limits.max_payload)
        .u16(limits.max_path)
        .u16(limits.max_name)
        .u16(limits.max_entries)
        .u32(feature_bits)
        .u32(server_time)
        .string(server_name);
    w.into_vec()
}

fn handle_statfs(cur: &mut Cursor, cfg: &Config, policy: &Policy, state: &ServerState) -> Result<Vec<u8>, Error> {
    if cur.remaining() > 0 {
        let raw = cur.string()?;
        normalize(&raw, cfg.limits.max_path as usize, cfg.limits.max_name as usize, false)?;
    }
    cur.expect_exhausted()?;

    let statfs = fs::statfs::statfs();
    let used = usage_for(state, policy)?;
    let mut w = Writer::new();
    w.u32(statfs.total).u32(statfs.free).u32(fs::statfs::clamp_u32(used));
    Ok(w.into_vec())
}

fn handle_ls(cur: &mut Cursor, cfg: &Config, policy: &Policy, state: &ServerState) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    let start_index = cur.u16()?;
    let max_entries_req = cur.u16()?;
    cur.expect_exhausted()?;
    let max_entries = max_entries_req.min(cfg.limits.max_entries);
    let budget = cfg.limits.max_payload as usize;
    const OVERHEAD: usize = 2 + 2;

    match route(policy, &normalized)? {
        Routed::Host(abs) => {
            let mut used = OVERHEAD;
            let page = fs::ls::list_page(&abs, start_index, max_entries, |e| {
                let entry_len = 1 + 4 + 4 + 1 + e.name.len().min(255);
                if used + entry_len > budget {
                    return false;
                }
                used += entry_len;
                true
            })?;
            let mut w = Writer::new();
            w.u16(page.entries.len() as u16);
            for e in &page.entries {
                let is_dir = e.is_dir || (policy.disk_images_enabled && is_image_name(&e.name));
                w.u8(if is_dir { 1 } else { 0 }).u32(e.size).u32(e.mtime_unix).string(&e.name);
            }
            w.u16(page.next_index);
            Ok(w.into_vec())
        }
        Routed::Image { image_abs, kind, inner } => {
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            let dir_tree = match img_ops::navigate(&loaded.tree, &inner, false)? {
                img_ops::Target::Root => &*loaded.tree,
                img_ops::Target::Dir(d) => d,
                img_ops::Target::File(_) => return Err(Error::Status(Status::NotADir)),
            };
            let mut entries = img_ops::list_entries(dir_tree, cfg.prg_fallback_enabled);
            entries.sort_by(|a, b| a.0.to_ascii_uppercase().cmp(&b.0.to_ascii_uppercase()));

            let start = start_index as usize;
            let mut w = Writer::new();
            if start >= entries.len() {
                w.u16(0).u16(fs::ls::END_OF_LIST);
                return Ok(w.into_vec());
            }
            let mut used = OVERHEAD;
            let mut emitted = Vec::new();
            let mut idx = start;
            while idx < entries.len() && emitted.len() < max_entries as usize {
                let (name, is_dir, size, mtime) = &entries[idx];
                let entry_len = 1 + 4 + 4 + 1 + name.len().min(255);
                if used + entry_len > budget {
                    break;
                }
                used += entry_len;
                emitted.push((name.clone(), *is_dir, *size, *mtime));
                idx += 1;
            }
            let next_index = if idx >= entries.len() { fs::ls::END_OF_LIST } else { idx as u16 };
            w.u16(emitted.len() as u16);
            for (name, is_dir, size, mtime) in &emitted {
                w.u8(if *is_dir { 1 } else { 0 }).u32(*size).u32(*mtime).string(name);
            }
            w.u16(next_index);
            Ok(w.into_vec())
        }
    }
}

fn handle_stat(cur: &mut Cursor, cfg: &Config, policy: &Policy, state: &ServerState) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;

    let (is_dir, size, mtime) = match route(policy, &normalized)? {
        Routed::Host(abs) => {
            let st = fs::stat::stat(&abs)?;
            let name = abs.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !st.is_dir && policy.disk_images_enabled && is_image_name(name) {
                (true, 0, st.mtime_unix)
            } else {
                (st.is_dir, st.size, st.mtime_unix)
            }
        }
        Routed::Image { image_abs, kind, inner } => {
            if inner.is_empty() {
                let meta = std::fs::metadata(&image_abs)?;
                (true, 0, mtime_unix(&meta))
            } else {
                let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
                match img_ops::navigate(&loaded.tree, &inner, cfg.prg_fallback_read_enabled)? {
                    img_ops::Target::Root | img_ops::Target::Dir(_) => (true, 0, 0),
                    img_ops::Target::File(entry) => (false, entry.size, 0),
                }
            }
        }
    };

    let mut w = Writer::new();
    w.u8(if is_dir { 1 } else { 0 }).u32(size).u32(mtime);
    Ok(w.into_vec())
}

fn handle_read_range(cur: &mut Cursor, cfg: &Config, policy: &Policy, state: &ServerState) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    let offset = cur.u32()?;
    let length = cur.u16()?;
    cur.expect_exhausted()?;
    if length > cfg.limits.max_chunk {
        return Err(Error::Status(Status::TooLarge));
    }

    match route(policy, &normalized)? {
        Routed::Host(abs) => fs::read_range::read_range(&abs, offset, length),
        Routed::Image { image_abs, kind, inner } => {
            if inner.is_empty() {
                return Err(Error::Status(Status::IsADir));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            let entry = match img_ops::navigate(&loaded.tree, &inner, cfg.prg_fallback_read_enabled)? {
                img_ops::Target::File(e) => e,
                _ => return Err(Error::Status(Status::IsADir)),
            };
            let bytes = img_ops::read_file(&loaded, entry);
            let size = bytes.len() as u64;
            if offset as u64 > size {
                return Err(Error::Status(Status::RangeInvalid));
            }
            if offset as u64 == size {
                return Ok(Vec::new());
            }
            let avail = size - offset as u64;
            let n = (length as u64).min(avail) as usize;
            Ok(bytes[offset as usize..offset as usize + n].to_vec())
        }
    }
}

fn handle_write_range(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    let offset = cur.u32()?;
    let data_len = cur.u16()?;
    let data = cur.bytes(data_len as usize)?;
    cur.expect_exhausted()?;

    let wflags = fs::write_range::WriteFlags {
        truncate: flags & flag_bits::WRITE_RANGE_TRUNCATE != 0,
        create: flags & flag_bits::WRITE_RANGE_CREATE != 0,
        overwrite: flags & flag_bits::WRITE_RANGE_OVERWRITE != 0,
    };

    let _guard = acquire_write(state)?;
    match route(policy, &normalized)? {
        Routed::Host(abs) => {
            let exists = abs.exists();
            let old_size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);
            fs::write_range::validate(exists, old_size, offset, wflags, policy.overwrite_enabled)?;
            let projected = fs::write_range::projected_size(old_size, offset, data.len(), wflags.truncate);
            check_caps(policy, state, projected, projected as i64 - old_size as i64)?;

            if wflags.truncate && exists && old_size > 0 {
                divert_or_remove(state, policy, &abs, normalized.as_str())?;
            }
            let delta = fs::write_range::write_range(&abs, offset, data, wflags)?;
            apply_usage_delta(state, policy, delta);
        }
        Routed::Image { image_abs, kind, inner } => {
            if offset != 0 {
                return Err(Error::Status(Status::NotSupported));
            }
            if inner.is_empty() {
                return Err(Error::Status(Status::IsADir));
            }
            put_raw_segments(cfg, policy, state, &image_abs, kind, &inner, data.to_vec(), wflags.overwrite || wflags.truncate)?;
        }
    }
    Ok(Vec::new())
}

fn handle_append(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    let data_len = cur.u16()?;
    let data = cur.bytes(data_len as usize)?;
    cur.expect_exhausted()?;
    let create = flags & flag_bits::APPEND_CREATE != 0;

    let _guard = acquire_write(state)?;
    match route(policy, &normalized)? {
        Routed::Host(abs) => {
            let old_size = std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0);
            check_caps(policy, state, old_size + data.len() as u64, data.len() as i64)?;
            let delta = fs::append::append(&abs, data, create)?;
            apply_usage_delta(state, policy, delta);
        }
        Routed::Image { image_abs, kind, inner } => {
            if inner.is_empty() {
                return Err(Error::Status(Status::IsADir));
            }
            if !policy.disk_images_write_enabled {
                return Err(Error::Status(Status::AccessDenied));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            let (mut bytes, file_type) = match img_ops::navigate(&loaded.tree, &inner, false)? {
                img_ops::Target::File(entry) => (img_ops::read_file(&loaded, entry), entry.file_type),
                _ if create => (Vec::new(), infer_cbm_type(inner.last().map(String::as_str).unwrap_or(""))),
                _ => return Err(Error::Status(Status::NotFound)),
            };
            bytes.extend_from_slice(data);
            let file_len = bytes.len() as u64;
            let (new_data, delta) = img_ops::plan_mutation(
                kind,
                &loaded,
                img_ops::Mutation::Put { segments: &inner, file_type, bytes },
            )?;
            check_caps(policy, state, file_len, delta)?;
            img_ops::commit_mutation(&state.image_cache, &image_abs, &new_data)?;
            apply_usage_delta(state, policy, delta);
        }
    }
    Ok(Vec::new())
}

fn handle_mkdir(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;
    let parents = flags & flag_bits::MKDIR_PARENTS != 0;
    if parents && !policy.mkdir_parents_enabled {
        return Err(Error::Status(Status::NotSupported));
    }

    let _guard = acquire_write(state)?;
    match route(policy, &normalized)? {
        Routed::Image { image_abs, kind, inner } if inner.is_empty() => {
            if image_abs.exists() {
                return Err(Error::Status(Status::AlreadyExists));
            }
            if !policy.disk_images_write_enabled {
                return Err(Error::Status(Status::AccessDenied));
            }
            if let Some(parent) = image_abs.parent() {
                if parents {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let (name, id) = derive_disk_name_id(&image_abs);
            let data = img_ops::format_empty(kind, &name, &id);
            img_ops::atomic_write(&image_abs, &data)?;
            apply_usage_delta(state, policy, data.len() as i64);
        }
        Routed::Image { image_abs, kind, inner } => {
            if kind != ImageKind::D81 {
                return Err(Error::Status(Status::NotSupported));
            }
            if !policy.disk_images_write_enabled {
                return Err(Error::Status(Status::AccessDenied));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            img_ops::apply_mutation(
                &state.image_cache,
                &image_abs,
                kind,
                &loaded,
                img_ops::Mutation::MkdirPartition { segments: &inner },
            )?;
        }
        Routed::Host(abs) => {
            fs::mkdir::mkdir(&abs, parents)?;
        }
    }
    Ok(Vec::new())
}

fn handle_rmdir(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;
    let recursive = flags & flag_bits::RMDIR_RECURSIVE != 0;
    if recursive && !policy.rmdir_recursive_enabled {
        return Err(Error::Status(Status::NotSupported));
    }

    let _guard = acquire_write(state)?;
    match route(policy, &normalized)? {
        Routed::Host(abs) => {
            fs::rmdir::rmdir(&abs, recursive)?;
            invalidate_usage(state, policy);
        }
        Routed::Image { image_abs, kind, inner } if inner.is_empty() => {
            divert_or_remove(state, policy, &image_abs, normalized.as_str())?;
            state.image_cache.invalidate(&image_abs.clone());
            invalidate_usage(state, policy);
        }
        Routed::Image { image_abs, kind, inner } => {
            if kind != ImageKind::D81 {
                return Err(Error::Status(Status::NotSupported));
            }
            if !policy.disk_images_write_enabled {
                return Err(Error::Status(Status::AccessDenied));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            img_ops::apply_mutation(
                &state.image_cache,
                &image_abs,
                kind,
                &loaded,
                img_ops::Mutation::RmdirPartition { segments: &inner, recursive },
            )?;
        }
    }
    Ok(Vec::new())
}

fn handle_rm(cur: &mut Cursor, cfg: &Config, policy: &Policy, state: &ServerState) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;

    let _guard = acquire_write(state)?;
    match route(policy, &normalized)? {
        Routed::Host(abs) => {
            let size = if policy.trash_enabled && !trash::is_reserved(normalized.as_str(), &policy.trash_dir) {
                let meta = std::fs::symlink_metadata(&abs).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::Status(Status::NotFound)
                    } else {
                        e.into()
                    }
                })?;
                if meta.is_dir() {
                    return Err(Error::Status(Status::IsADir));
                }
                let sz = meta.len();
                trash::divert(&policy.root, &policy.trash_dir, &abs, normalized.as_str(), now_unix(), rand4)?;
                sz
            } else {
                fs::rm::rm(&abs)?
            };
            apply_usage_delta(state, policy, -(size as i64));
        }
        Routed::Image { image_abs, kind, inner } => {
            if inner.is_empty() {
                return Err(Error::Status(Status::IsADir));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            match img_ops::navigate(&loaded.tree, &inner, cfg.prg_fallback_enabled)? {
                img_ops::Target::File(_) => {}
                _ => return Err(Error::Status(Status::IsADir)),
            }
            let delta = img_ops::apply_mutation(
                &state.image_cache,
                &image_abs,
                kind,
                &loaded,
                img_ops::Mutation::Delete { segments: &inner },
            )?;
            apply_usage_delta(state, policy, delta);
        }
    }
    Ok(Vec::new())
}

/// Shared by `WRITE_RANGE` (truncating overwrite) and `RMDIR` on an image
/// root: diverts `target` to trash unless it's already reserved, in which
/// case it's removed in place (`spec.md` §4.6).
fn divert_or_remove(state: &ServerState, policy: &Policy, target: &Path, relative: &str) -> Result<(), Error> {
    if policy.trash_enabled && !trash::is_reserved(relative, &policy.trash_dir) {
        trash::divert(&policy.root, &policy.trash_dir, target, relative, now_unix(), rand4)?;
        invalidate_usage(state, policy);
    } else {
        std::fs::remove_file(target)?;
    }
    Ok(())
}

fn put_raw_segments(
    _cfg: &Config,
    policy: &Policy,
    state: &ServerState,
    image_abs: &Path,
    kind: ImageKind,
    segments: &[String],
    bytes: Vec<u8>,
    overwrite: bool,
) -> Result<(), Error> {
    if !policy.disk_images_write_enabled {
        return Err(Error::Status(Status::AccessDenied));
    }
    let loaded = img_ops::load(&state.image_cache, image_abs, kind)?;
    let existing = img_ops::navigate(&loaded.tree, segments, false);
    if matches!(existing, Ok(img_ops::Target::File(_))) && !overwrite {
        return Err(Error::Status(Status::AlreadyExists));
    }
    let file_len = bytes.len() as u64;
    let file_type = infer_cbm_type(segments.last().map(String::as_str).unwrap_or(""));
    let (new_data, delta) =
        img_ops::plan_mutation(kind, &loaded, img_ops::Mutation::Put { segments, file_type, bytes })?;
    check_caps(policy, state, file_len, delta)?;
    img_ops::commit_mutation(&state.image_cache, image_abs, &new_data)?;
    apply_usage_delta(state, policy, delta);
    Ok(())
}

/// Resolves the destination segments for a copy into an image: if `dst_inner`
/// names an existing partition (or the mount root), the source's basename
/// is appended; otherwise `dst_inner` names the destination leaf directly
/// (`spec.md` §4.5 `CP` "Dst may be an existing directory").
fn dest_segments_in_image(
    loaded: &img_ops::Loaded,
    dst_inner: &[String],
    src_basename: &str,
) -> Vec<String> {
    if dst_inner.is_empty() {
        return vec![src_basename.to_string()];
    }
    if matches!(img_ops::navigate(&loaded.tree, dst_inner, false), Ok(img_ops::Target::Dir(_))) {
        let mut v = dst_inner.to_vec();
        v.push(src_basename.to_string());
        return v;
    }
    dst_inner.to_vec()
}

fn handle_cp(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let src_normalized = read_path(cur, &cfg.limits, true)?;
    let dst_normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;
    let overwrite = flags & flag_bits::CP_OVERWRITE != 0;
    let recursive = flags & flag_bits::CP_RECURSIVE != 0;
    if recursive && !policy.cp_recursive_enabled {
        return Err(Error::Status(Status::NotSupported));
    }

    let _guard = acquire_write(state)?;

    let has_wildcard = src_normalized.basename().is_some_and(|b| b.contains('*') || b.contains('?'));
    if has_wildcard {
        return handle_cp_wildcard(cfg, policy, state, &src_normalized, &dst_normalized, overwrite);
    }

    match (route(policy, &src_normalized)?, route(policy, &dst_normalized)?) {
        (Routed::Host(src_abs), Routed::Host(dst_abs)) => {
            let dst_abs = fs::cp::resolve_destination(&src_abs, &dst_abs);
            if src_abs.is_dir() {
                if !recursive {
                    return Err(Error::Status(Status::IsADir));
                }
                fs::cp::copy_dir_recursive(&src_abs, &dst_abs, overwrite)?;
                invalidate_usage(state, policy);
            } else {
                let bytes = std::fs::metadata(&src_abs)?.len();
                check_caps(policy, state, bytes, 0)?;
                if dst_abs.exists() {
                    if !overwrite {
                        return Err(Error::Status(Status::AlreadyExists));
                    }
                    if policy.trash_enabled {
                        let rel = sandbox_relative(policy, &dst_abs);
                        if !trash::is_reserved(&rel, &policy.trash_dir) {
                            trash::divert(&policy.root, &policy.trash_dir, &dst_abs, &rel, now_unix(), rand4)?;
                        }
                    }
                }
                fs::cp::copy_file(&src_abs, &dst_abs, true)?;
                apply_usage_delta(state, policy, bytes as i64);
            }
        }
        (Routed::Host(src_abs), Routed::Image { image_abs, kind, inner }) => {
            if src_abs.is_dir() {
                if !recursive || kind != ImageKind::D81 || !inner.is_empty() {
                    return Err(Error::Status(Status::NotSupported));
                }
                copy_host_dir_into_d81(policy, state, &src_abs, &image_abs)?;
            } else {
                let bytes = std::fs::read(&src_abs)?;
                let basename = src_abs.file_name().and_then(|n| n.to_str()).unwrap_or("").to_ascii_uppercase();
                let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
                let segments = dest_segments_in_image(&loaded, &inner, &basename);
                put_raw_segments(cfg, policy, state, &image_abs, kind, &segments, bytes, overwrite)?;
            }
        }
        (Routed::Image { image_abs, kind, inner }, Routed::Host(dst_abs)) => {
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            match img_ops::navigate(&loaded.tree, &inner, cfg.prg_fallback_read_enabled)? {
                img_ops::Target::File(entry) => {
                    let bytes = img_ops::read_file(&loaded, entry);
                    let name = img_ops::display_name(entry, cfg.prg_fallback_enabled);
                    let dst_abs = fs::cp::resolve_destination(Path::new(name), &dst_abs);
                    if dst_abs.exists() && !overwrite {
                        return Err(Error::Status(Status::AlreadyExists));
                    }
                    check_caps(policy, state, bytes.len() as u64, 0)?;
                    std::fs::write(&dst_abs, &bytes)?;
                    apply_usage_delta(state, policy, bytes.len() as i64);
                }
                img_ops::Target::Root | img_ops::Target::Dir(_) => {
                    if !recursive || kind != ImageKind::D81 {
                        return Err(Error::Status(Status::NotSupported));
                    }
                    copy_d81_dir_to_host(cfg, policy, &loaded, &inner, &dst_abs, overwrite)?;
                    invalidate_usage(state, policy);
                }
            }
        }
        (
            Routed::Image { image_abs: src_image, kind: src_kind, inner: src_inner },
            Routed::Image { image_abs: dst_image, kind: dst_kind, inner: dst_inner },
        ) => {
            let src_loaded = img_ops::load(&state.image_cache, &src_image, src_kind)?;
            let entry = match img_ops::navigate(&src_loaded.tree, &src_inner, cfg.prg_fallback_read_enabled)? {
                img_ops::Target::File(e) => e,
                _ => return Err(Error::Status(Status::NotSupported)),
            };
            let bytes = img_ops::read_file(&src_loaded, entry);
            let file_type = entry.file_type;
            let basename = entry.name.clone();

            let dst_loaded = if dst_image == src_image && dst_kind == src_kind {
                None
            } else {
                Some(img_ops::load(&state.image_cache, &dst_image, dst_kind)?)
            };
            let dst_tree_loaded = dst_loaded.as_ref().unwrap_or(&src_loaded);
            let segments = dest_segments_in_image(dst_tree_loaded, &dst_inner, &basename);

            if !policy.disk_images_write_enabled {
                return Err(Error::Status(Status::AccessDenied));
            }
            let loaded = img_ops::load(&state.image_cache, &dst_image, dst_kind)?;
            let existing = img_ops::navigate(&loaded.tree, &segments, false);
            if matches!(existing, Ok(img_ops::Target::File(_))) && !overwrite {
                return Err(Error::Status(Status::AlreadyExists));
            }
            let file_len = bytes.len() as u64;
            let (new_data, delta) = img_ops::plan_mutation(
                dst_kind,
                &loaded,
                img_ops::Mutation::Put { segments: &segments, file_type, bytes },
            )?;
            check_caps(policy, state, file_len, delta)?;
            img_ops::commit_mutation(&state.image_cache, &dst_image, &new_data)?;
            apply_usage_delta(state, policy, delta);
        }
    }
    Ok(Vec::new())
}

fn copy_host_dir_into_d81(
    policy: &Policy,
    state: &ServerState,
    src_dir: &Path,
    image_abs: &Path,
) -> Result<(), Error> {
    if !policy.disk_images_write_enabled {
        return Err(Error::Status(Status::AccessDenied));
    }
    for entry in std::fs::read_dir(src_dir)? {
        let entry = entry?;
        let name = entry.file_name().into_string().map_err(|_| Error::Codec("non-UTF-8 file name"))?;
        let upper = name.to_ascii_uppercase();
        if entry.file_type()?.is_dir() {
            let loaded = img_ops::load(&state.image_cache, image_abs, ImageKind::D81)?;
            if !matches!(img_ops::navigate(&loaded.tree, std::slice::from_ref(&upper), false), Ok(img_ops::Target::Dir(_))) {
                img_ops::apply_mutation(
                    &state.image_cache,
                    image_abs,
                    ImageKind::D81,
                    &loaded,
                    img_ops::Mutation::MkdirPartition { segments: std::slice::from_ref(&upper) },
                )?;
            }
            for sub in std::fs::read_dir(entry.path())? {
                let sub = sub?;
                if sub.file_type()?.is_dir() {
                    continue;
                }
                let sub_name = sub.file_name().into_string().map_err(|_| Error::Codec("non-UTF-8 file name"))?;
                let bytes = std::fs::read(sub.path())?;
                let segments = vec![upper.clone(), sub_name.to_ascii_uppercase()];
                put_raw_segments_unchecked_policy(state, image_abs, ImageKind::D81, &segments, bytes)?;
            }
        } else {
            let bytes = std::fs::read(entry.path())?;
            put_raw_segments_unchecked_policy(state, image_abs, ImageKind::D81, &[upper], bytes)?;
        }
    }
    Ok(())
}

/// Like [`put_raw_segments`] but for the bulk recursive-copy path, which
/// has already checked `disk_images_write_enabled` once for the whole
/// operation rather than per file.
fn put_raw_segments_unchecked_policy(
    state: &ServerState,
    image_abs: &Path,
    kind: ImageKind,
    segments: &[String],
    bytes: Vec<u8>,
) -> Result<(), Error> {
    let loaded = img_ops::load(&state.image_cache, image_abs, kind)?;
    let file_type = infer_cbm_type(segments.last().map(String::as_str).unwrap_or(""));
    img_ops::apply_mutation(
        &state.image_cache,
        image_abs,
        kind,
        &loaded,
        img_ops::Mutation::Put { segments, file_type, bytes },
    )?;
    Ok(())
}

fn copy_d81_dir_to_host(
    cfg: &Config,
    _policy: &Policy,
    loaded: &img_ops::Loaded,
    inner: &[String],
    dst_dir: &Path,
    overwrite: bool,
) -> Result<(), Error> {
    let tree = match img_ops::navigate(&loaded.tree, inner, cfg.prg_fallback_read_enabled)? {
        img_ops::Target::Root => &*loaded.tree,
        img_ops::Target::Dir(d) => d,
        img_ops::Target::File(_) => return Err(Error::Status(Status::NotADir)),
    };
    std::fs::create_dir_all(dst_dir)?;
    write_tree_to_host(cfg, loaded, tree, dst_dir, overwrite)
}

fn write_tree_to_host(
    cfg: &Config,
    loaded: &img_ops::Loaded,
    tree: &crate::image::ImageTree,
    dst_dir: &Path,
    overwrite: bool,
) -> Result<(), Error> {
    for entry in tree.files.values() {
        let name = img_ops::display_name(entry, cfg.prg_fallback_enabled);
        let dst = dst_dir.join(name);
        if dst.exists() && !overwrite {
            return Err(Error::Status(Status::AlreadyExists));
        }
        std::fs::write(&dst, img_ops::read_file(loaded, entry))?;
    }
    for (name, sub) in &tree.dirs {
        let sub_dst = dst_dir.join(name);
        std::fs::create_dir_all(&sub_dst)?;
        write_tree_to_host(cfg, loaded, sub, &sub_dst, overwrite)?;
    }
    Ok(())
}

fn handle_cp_wildcard(
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
    src: &NormalizedPath,
    dst: &NormalizedPath,
    overwrite: bool,
) -> Result<Vec<u8>, Error> {
    let parent = src.parent().ok_or(Error::Status(Status::InvalidPath))?;
    let pattern = src.basename().ok_or(Error::Status(Status::InvalidPath))?.to_string();
    let parent_abs = sandbox::resolve(&policy.root, &parent)?;
    let dst_routed = route(policy, dst)?;

    match &dst_routed {
        Routed::Host(dst_abs) => {
            if !dst_abs.is_dir() {
                return Err(Error::Status(Status::NotADir));
            }
        }
        Routed::Image { inner, .. } if inner.is_empty() => {}
        Routed::Image { .. } => return Err(Error::Status(Status::NotSupported)),
    }

    for entry in fs::list_dir(&parent_abs)? {
        if entry.is_dir || !glob_match(&pattern, &entry.name) {
            continue;
        }
        let bytes = std::fs::read(parent_abs.join(&entry.name))?;
        match &dst_routed {
            Routed::Host(dst_abs) => {
                let target = dst_abs.join(&entry.name);
                if target.exists() && !overwrite {
                    continue;
                }
                check_caps(policy, state, bytes.len() as u64, 0)?;
                std::fs::write(&target, &bytes)?;
                apply_usage_delta(state, policy, bytes.len() as i64);
            }
            Routed::Image { image_abs, kind, .. } => {
                let upper = entry.name.to_ascii_uppercase();
                put_raw_segments(cfg, policy, state, image_abs, *kind, &[upper], bytes, overwrite)?;
            }
        }
    }
    Ok(Vec::new())
}

fn glob_match(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], n) || (!n.is_empty() && rec(p, &n[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &n[1..]),
            (Some(&pc), Some(&nc)) if pc.to_ascii_uppercase() == nc.to_ascii_uppercase() => rec(&p[1..], &n[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

fn handle_mv(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let src_normalized = read_path(cur, &cfg.limits, false)?;
    let dst_normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;
    let overwrite = flags & flag_bits::MV_OVERWRITE != 0;

    let _guard = acquire_write(state)?;
    let src_routed = route(policy, &src_normalized)?;
    let dst_routed = route(policy, &dst_normalized)?;

    let src_is_image_root = matches!(&src_routed, Routed::Image { inner, .. } if inner.is_empty());
    if src_is_image_root {
        let src_abs = match &src_routed {
            Routed::Image { image_abs, .. } => image_abs.clone(),
            _ => unreachable!(),
        };
        let dst_abs = match &dst_routed {
            Routed::Host(d) => d.clone(),
            Routed::Image { image_abs, inner, .. } if inner.is_empty() => image_abs.clone(),
            _ => return Err(Error::Status(Status::NotSupported)),
        };
        return mv_image_file(policy, state, &src_abs, &dst_abs, overwrite);
    }

    match (src_routed, dst_routed) {
        (Routed::Host(src_abs), Routed::Host(dst_abs)) => mv_host(policy, state, &src_abs, &dst_abs, overwrite),
        (
            Routed::Image { image_abs: si, kind: sk, inner: sin },
            Routed::Image { image_abs: di, kind: dk, inner: din },
        ) => mv_in_image(policy, state, &si, sk, &sin, &di, dk, &din, overwrite),
        _ => Err(Error::Status(Status::NotSupported)),
    }
}

fn mv_image_file(policy: &Policy, state: &ServerState, src_abs: &Path, dst_abs: &Path, overwrite: bool) -> Result<Vec<u8>, Error> {
    let src_name = src_abs.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
    let dst_name = dst_abs.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
    let reconciled = fs::mv::reconcile_image_extension(&src_name, &dst_name, policy.disk_images_allow_rename_convert)?;
    let final_dst = dst_abs.with_file_name(reconciled);

    if final_dst.exists() {
        if !overwrite {
            return Err(Error::Status(Status::AlreadyExists));
        }
        if policy.trash_enabled {
            let rel = sandbox_relative(policy, &final_dst);
            if !trash::is_reserved(&rel, &policy.trash_dir) {
                trash::divert(&policy.root, &policy.trash_dir, &final_dst, &rel, now_unix(), rand4)?;
            }
        }
    }
    fs::mv::mv(src_abs, &final_dst, true)?;
    state.image_cache.invalidate(&src_abs.to_path_buf());
    invalidate_usage(state, policy);
    Ok(Vec::new())
}

fn mv_host(policy: &Policy, state: &ServerState, src_abs: &Path, dst_abs: &Path, overwrite: bool) -> Result<Vec<u8>, Error> {
    let dst_abs = fs::cp::resolve_destination(src_abs, dst_abs);
    let src_name = src_abs.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
    let final_dst = if policy.disk_images_enabled && is_image_name(&src_name) {
        let dst_name = dst_abs.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
        let reconciled = fs::mv::reconcile_image_extension(&src_name, &dst_name, policy.disk_images_allow_rename_convert)?;
        dst_abs.with_file_name(reconciled)
    } else {
        dst_abs
    };

    if final_dst.exists() {
        if !overwrite {
            return Err(Error::Status(Status::AlreadyExists));
        }
        if policy.trash_enabled {
            let rel = sandbox_relative(policy, &final_dst);
            if !trash::is_reserved(&rel, &policy.trash_dir) {
                trash::divert(&policy.root, &policy.trash_dir, &final_dst, &rel, now_unix(), rand4)?;
            }
        }
    }
    fs::mv::mv(src_abs, &final_dst, true)?;
    invalidate_usage(state, policy);
    Ok(Vec::new())
}

#[allow(clippy::too_many_arguments)]
fn mv_in_image(
    policy: &Policy,
    state: &ServerState,
    src_image: &Path,
    src_kind: ImageKind,
    src_inner: &[String],
    dst_image: &Path,
    dst_kind: ImageKind,
    dst_inner: &[String],
    overwrite: bool,
) -> Result<Vec<u8>, Error> {
    if src_image != dst_image || src_kind != dst_kind {
        return Err(Error::Status(Status::NotSupported));
    }
    if src_inner.is_empty() || dst_inner.is_empty() {
        return Err(Error::Status(Status::NotSupported));
    }
    if src_inner[..src_inner.len() - 1] != dst_inner[..dst_inner.len() - 1] {
        return Err(Error::Status(Status::NotSupported));
    }
    if !policy.disk_images_write_enabled {
        return Err(Error::Status(Status::AccessDenied));
    }
    let loaded = img_ops::load(&state.image_cache, src_image, src_kind)?;
    let existing = img_ops::navigate(&loaded.tree, dst_inner, false);
    if matches!(existing, Ok(img_ops::Target::File(_))) && !overwrite {
        return Err(Error::Status(Status::AlreadyExists));
    }
    let new_name = dst_inner.last().unwrap().clone();
    img_ops::apply_mutation(
        &state.image_cache,
        src_image,
        src_kind,
        &loaded,
        img_ops::Mutation::Rename { segments: src_inner, new_name: &new_name },
    )?;
    Ok(Vec::new())
}

fn handle_search(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    _state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let base_normalized = read_path(cur, &cfg.limits, false)?;
    let query = cur.string()?;
    let start_index = cur.u16()?;
    let max_results = cur.u16()?;
    let max_scan_bytes = cur.u32()?;
    cur.expect_exhausted()?;
    if query.is_empty() {
        return Err(Error::Status(Status::BadRequest));
    }

    let base_abs = match route(policy, &base_normalized)? {
        Routed::Host(abs) => abs,
        Routed::Image { .. } => return Err(Error::Status(Status::NotSupported)),
    };
    let opts = fs::search::SearchOptions {
        case_insensitive: flags & flag_bits::SEARCH_CASE_INSENSITIVE != 0,
        recursive: flags & flag_bits::SEARCH_RECURSIVE != 0,
        whole_word: flags & flag_bits::SEARCH_WHOLE_WORD != 0,
        max_results,
        max_scan_bytes,
    };
    let root = policy.root.clone();
    let result = fs::search::search(&base_abs, query.as_bytes(), start_index, &opts, |p| {
        let rel = p.strip_prefix(&root).unwrap_or(p);
        format!("/{}", rel.to_string_lossy().replace('\\', "/"))
    })?;

    let mut w = Writer::new();
    w.u16(result.hits.len() as u16);
    for hit in &result.hits {
        w.string(&hit.path).u32(hit.offset).u16(hit.preview.len() as u16).bytes(&hit.preview);
    }
    let next_index = if result.complete { 0xFFFFu16 } else { start_index + result.hits.len() as u16 };
    w.u16(next_index);
    Ok(w.into_vec())
}

fn handle_hash(
    cur: &mut Cursor,
    flags: u8,
    cfg: &Config,
    policy: &Policy,
    state: &ServerState,
) -> Result<Vec<u8>, Error> {
    let normalized = read_path(cur, &cfg.limits, false)?;
    cur.expect_exhausted()?;
    if flags & flag_bits::HASH_ALGO_SHA1 != 0 {
        return Err(Error::Status(Status::NotSupported));
    }

    let crc = match route(policy, &normalized)? {
        Routed::Host(abs) => fs::hash::hash_crc32(&abs)?,
        Routed::Image { image_abs, kind, inner } => {
            if inner.is_empty() {
                return Err(Error::Status(Status::IsADir));
            }
            let loaded = img_ops::load(&state.image_cache, &image_abs, kind)?;
            match img_ops::navigate(&loaded.tree, &inner, cfg.prg_fallback_read_enabled)? {
                img_ops::Target::File(entry) => img_ops::hash_file(&loaded, entry),
                _ => return Err(Error::Status(Status::IsADir)),
            }
        }
    };
    let mut w = Writer::new();
    w.u32(crc);
    Ok(w.into_vec())
}
