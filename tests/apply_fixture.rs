use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use fwapply::fat::{FatController, FixedTimeProvider};
use fwapply::{ApplyError, Output, ProgressReporter, apply, mbr};

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

struct Recorder(Vec<u8>);

impl ProgressReporter for Recorder {
    fn report(&mut self, percent: u8) {
        self.0.push(percent);
    }
}

fn sha_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build a firmware ZIP in memory: optional detached signature entry, then
/// the manifest, then the resource payloads under `data/`.
fn build_archive(
    signature: Option<&[u8; 64]>,
    manifest: &[u8],
    resources: &[(&str, &[u8])],
) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    if let Some(sig) = signature {
        zip.start_file("meta.conf.ed25519", opts).unwrap();
        zip.write_all(sig).unwrap();
    }
    zip.start_file("meta.conf", opts).unwrap();
    zip.write_all(manifest).unwrap();
    for (id, data) in resources {
        zip.start_file(format!("data/{id}"), opts).unwrap();
        zip.write_all(data).unwrap();
    }

    zip.finish().unwrap().into_inner()
}

fn signed_archive(
    key_seed: u8,
    manifest: &[u8],
    resources: &[(&str, &[u8])],
) -> (Vec<u8>, [u8; 32]) {
    let key = SigningKey::from_bytes(&[key_seed; 32]);
    let signature = key.sign(manifest).to_bytes();
    (
        build_archive(Some(&signature), manifest, resources),
        key.verifying_key().to_bytes(),
    )
}

/// Apply `archive` to a fresh temporary sink, collecting progress reports.
fn run_against(
    sink: &NamedTempFile,
    archive: Vec<u8>,
    prefix: &str,
    key: Option<&[u8; 32]>,
) -> (Result<(), ApplyError>, Vec<u8>) {
    let file = reopen(sink);
    let mut recorder = Recorder(Vec::new());
    let result = apply(
        Cursor::new(archive),
        prefix,
        Output::from_file(file),
        &mut recorder,
        key,
    );
    (result, recorder.0)
}

fn run(archive: Vec<u8>, prefix: &str, key: Option<&[u8; 32]>) -> (NamedTempFile, Result<(), ApplyError>, Vec<u8>) {
    let sink = NamedTempFile::new().unwrap();
    let (result, reports) = run_against(&sink, archive, prefix, key);
    (sink, result, reports)
}

fn reopen(sink: &NamedTempFile) -> File {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(sink.path())
        .unwrap()
}

fn sink_bytes(sink: &NamedTempFile) -> Vec<u8> {
    std::fs::read(sink.path()).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Dense and sparse placement
// ---------------------------------------------------------------------------

#[test]
fn dense_single_resource_apply() {
    let payload = pattern(1024);
    let manifest = format!(
        "file-resource \"boot.img\" {{\n length=1024\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"boot.img\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("boot.img", &payload)]);

    let (sink, result, _) = run(archive, "complete", None);
    result.expect("apply should succeed");

    let bytes = sink_bytes(&sink);
    assert_eq!(bytes, payload, "payload must land at offset 0 and nowhere else");
}

#[test]
fn leading_hole_resource_lands_past_the_hole() {
    let payload = vec![0xAB; 512];
    let manifest = format!(
        "file-resource \"spare.img\" {{\n length={{0,2048,512}}\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"spare.img\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("spare.img", &payload)]);

    let (sink, result, _) = run(archive, "complete", None);
    result.expect("apply should succeed");

    let bytes = sink_bytes(&sink);
    assert_eq!(bytes.len(), 2560);
    assert!(bytes[..2048].iter().all(|&b| b == 0), "hole must stay zero");
    assert!(bytes[2048..].iter().all(|&b| b == 0xAB));
}

#[test]
fn raw_write_applies_destination_block_offset() {
    let payload = pattern(512);
    let manifest = format!(
        "file-resource \"a\" {{\n length=512\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"a\" {{ funlist={{\"2\",\"raw_write\",\"4\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("a", &payload)]);

    let (sink, result, _) = run(archive, "complete", None);
    result.unwrap();

    let bytes = sink_bytes(&sink);
    assert!(bytes[..2048].iter().all(|&b| b == 0));
    assert_eq!(&bytes[2048..2560], &payload[..]);
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

#[test]
fn signed_archive_applies_with_matching_key() {
    let payload = pattern(256);
    let manifest = format!(
        "file-resource \"a\" {{\n length=256\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"a\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let (archive, key) = signed_archive(1, manifest.as_bytes(), &[("a", &payload)]);

    let (sink, result, _) = run(archive, "complete", Some(&key));
    result.expect("signed apply should succeed");
    assert_eq!(sink_bytes(&sink), payload);
}

#[test]
fn flipping_a_manifest_bit_fails_before_any_write() {
    let payload = pattern(256);
    let manifest = format!(
        "file-resource \"a\" {{\n length=256\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"a\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );

    let key = SigningKey::from_bytes(&[1u8; 32]);
    let signature = key.sign(manifest.as_bytes()).to_bytes();
    let mut tampered = manifest.into_bytes();
    tampered[3] ^= 0x01;
    let archive = build_archive(Some(&signature), &tampered, &[("a", &payload)]);

    let (sink, result, _) = run(archive, "complete", Some(&key.verifying_key().to_bytes()));
    assert!(matches!(result, Err(ApplyError::SignatureVerify)));
    assert!(sink_bytes(&sink).is_empty(), "no payload byte may be written");
}

#[test]
fn unsigned_archive_with_key_is_rejected() {
    let archive = build_archive(None, b"task \"complete\" { }", &[]);
    let (_, result, _) = run(archive, "complete", Some(&[9u8; 32]));
    assert!(matches!(result, Err(ApplyError::SignatureVerify)));
}

#[test]
fn wrong_key_is_rejected() {
    let manifest = b"task \"complete\" { }".to_vec();
    let (archive, _) = signed_archive(1, &manifest, &[]);
    let other = SigningKey::from_bytes(&[2u8; 32]).verifying_key().to_bytes();

    let (_, result, _) = run(archive, "complete", Some(&other));
    assert!(matches!(result, Err(ApplyError::SignatureVerify)));
}

#[test]
fn truncated_signature_entry_is_rejected() {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file("meta.conf.ed25519", opts).unwrap();
    zip.write_all(&[0u8; 10]).unwrap();
    zip.start_file("meta.conf", opts).unwrap();
    zip.write_all(b"task \"complete\" { }").unwrap();
    let archive = zip.finish().unwrap().into_inner();

    let (_, result, _) = run(archive, "complete", None);
    assert!(matches!(result, Err(ApplyError::BadSignatureSize { actual: 10 })));
}

#[test]
fn archive_without_manifest_is_rejected() {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file("data/rogue", opts).unwrap();
    zip.write_all(b"xx").unwrap();
    let archive = zip.finish().unwrap().into_inner();

    let (_, result, _) = run(archive, "complete", None);
    assert!(matches!(result, Err(ApplyError::MissingManifest)));
}

// ---------------------------------------------------------------------------
// Task selection
// ---------------------------------------------------------------------------

fn selection_manifest(payload: &[u8]) -> String {
    format!(
        "file-resource \"marker\" {{\n length={}\n sha256=\"{}\"\n}}\n\
         task \"complete-a\" {{\n require-partition1-offset=1000\n \
           on-resource \"marker\" {{ funlist={{\"2\",\"raw_write\",\"16\"}} }}\n}}\n\
         task \"complete-b\" {{\n \
           on-resource \"marker\" {{ funlist={{\"2\",\"raw_write\",\"32\"}} }}\n}}\n",
        payload.len(),
        sha_hex(payload)
    )
}

fn write_mbr_with_partition1(sink: &NamedTempFile, block_offset: u32) {
    let parts = [
        Some(mbr::Partition {
            boot: true,
            partition_type: 0x0c,
            block_offset: 63,
            block_count: 100,
        }),
        Some(mbr::Partition {
            boot: false,
            partition_type: 0x83,
            block_offset,
            block_count: 100,
        }),
        None,
        None,
    ];
    let mut file = reopen(sink);
    file.write_all(&mbr::encode(&parts)).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn legacy_offset_constraint_selects_the_matching_task() {
    let payload = b"MARK".to_vec();
    let manifest = selection_manifest(&payload);

    let sink = NamedTempFile::new().unwrap();
    write_mbr_with_partition1(&sink, 1000);

    let archive = build_archive(None, manifest.as_bytes(), &[("marker", &payload)]);
    let (result, _) = run_against(&sink, archive, "complete", None);
    result.unwrap();

    let bytes = sink_bytes(&sink);
    assert_eq!(&bytes[16 * 512..16 * 512 + 4], b"MARK", "complete-a must run");
    assert!(bytes.len() < 32 * 512, "complete-b must not run");
}

#[test]
fn unreadable_mbr_falls_through_to_unconstrained_task() {
    let payload = b"MARK".to_vec();
    let manifest = selection_manifest(&payload);

    // Empty sink: the 512-byte read at offset 0 comes up short.
    let archive = build_archive(None, manifest.as_bytes(), &[("marker", &payload)]);
    let (sink, result, _) = run(archive, "complete", None);
    result.unwrap();

    let bytes = sink_bytes(&sink);
    assert_eq!(&bytes[32 * 512..32 * 512 + 4], b"MARK", "complete-b must run");
}

#[test]
fn mismatched_partition_offset_rejects_the_task() {
    let payload = b"MARK".to_vec();
    let manifest = selection_manifest(&payload);

    let sink = NamedTempFile::new().unwrap();
    write_mbr_with_partition1(&sink, 2000);

    let archive = build_archive(None, manifest.as_bytes(), &[("marker", &payload)]);
    let (result, _) = run_against(&sink, archive, "complete", None);
    result.unwrap();

    let bytes = sink_bytes(&sink);
    assert_eq!(&bytes[32 * 512..32 * 512 + 4], b"MARK", "complete-b must run");
}

#[test]
fn reqlist_predicate_gates_selection() {
    let payload = b"DATA".to_vec();
    let manifest = format!(
        "file-resource \"r\" {{\n length=4\n sha256=\"{}\"\n}}\n\
         task \"upgrade-a\" {{\n reqlist={{\"3\",\"require_partition_offset\",\"1\",\"1000\"}}\n \
           on-resource \"r\" {{ funlist={{\"2\",\"raw_write\",\"16\"}} }}\n}}\n\
         task \"upgrade-b\" {{\n \
           on-resource \"r\" {{ funlist={{\"2\",\"raw_write\",\"32\"}} }}\n}}\n",
        sha_hex(&payload)
    );

    let sink = NamedTempFile::new().unwrap();
    write_mbr_with_partition1(&sink, 1000);
    let archive = build_archive(None, manifest.as_bytes(), &[("r", &payload)]);
    let (result, _) = run_against(&sink, archive, "upgrade", None);
    result.unwrap();
    assert_eq!(&sink_bytes(&sink)[16 * 512..16 * 512 + 4], b"DATA");

    // Without the matching MBR the requirement fails and upgrade-b runs.
    let archive = build_archive(None, manifest.as_bytes(), &[("r", &payload)]);
    let (sink2, result, _) = run(archive, "upgrade", None);
    result.unwrap();
    assert_eq!(&sink_bytes(&sink2)[32 * 512..32 * 512 + 4], b"DATA");
}

#[test]
fn selection_is_stable_across_runs() {
    let payload = b"MARK".to_vec();
    let manifest = selection_manifest(&payload);

    for _ in 0..2 {
        let sink = NamedTempFile::new().unwrap();
        write_mbr_with_partition1(&sink, 1000);
        let archive = build_archive(None, manifest.as_bytes(), &[("marker", &payload)]);
        let (result, _) = run_against(&sink, archive, "complete", None);
        result.unwrap();
        assert_eq!(&sink_bytes(&sink)[16 * 512..16 * 512 + 4], b"MARK");
    }
}

#[test]
fn no_applicable_task_is_an_error() {
    let archive = build_archive(None, b"task \"complete\" { }", &[]);
    let (_, result, _) = run(archive, "upgrade", None);
    match result {
        Err(ApplyError::NoApplicableTask(prefix)) => assert_eq!(prefix, "upgrade"),
        other => panic!("expected NoApplicableTask, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Missing and unexpected resources
// ---------------------------------------------------------------------------

#[test]
fn missing_file_resource_is_skipped_in_plan_pass() {
    let payload = pattern(128);
    let manifest = format!(
        "file-resource \"real\" {{\n length=128\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n \
           on-resource \"extra\" {{ funlist={{\"2\",\"raw_write\",\"64\"}} }}\n \
           on-resource \"real\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("real", &payload)]);

    let (sink, result, _) = run(archive, "complete", None);
    result.expect("missing file-resource must not fail the apply");
    assert_eq!(sink_bytes(&sink), payload);
}

#[test]
fn archive_entry_without_file_resource_is_fatal() {
    let manifest = "task \"complete\" { }";
    let archive = build_archive(None, manifest.as_bytes(), &[("ghost", b"boo")]);

    let (_, result, _) = run(archive, "complete", None);
    assert!(matches!(
        result,
        Err(ApplyError::SparseMapInvalid { resource, .. }) if resource == "ghost"
    ));
}

#[test]
fn unconsumed_resource_is_not_hash_checked() {
    // The task never reads "extra", so its (deliberately wrong) hash is
    // never validated.
    let payload = pattern(64);
    let manifest = format!(
        "file-resource \"used\" {{\n length=64\n sha256=\"{}\"\n}}\n\
         file-resource \"extra\" {{\n length=16\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"used\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload),
        "ff".repeat(32)
    );
    let archive = build_archive(
        None,
        manifest.as_bytes(),
        &[("used", &payload), ("extra", &[0u8; 16])],
    );

    let (_, result, _) = run(archive, "complete", None);
    result.expect("unused resource must not be hash checked");
}

#[test]
fn corrupted_payload_fails_the_hash_check() {
    let payload = pattern(64);
    let manifest = format!(
        "file-resource \"a\" {{\n length=64\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"a\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let mut corrupted = payload.clone();
    corrupted[10] ^= 0xFF;
    let archive = build_archive(None, manifest.as_bytes(), &[("a", &corrupted)]);

    let (_, result, _) = run(archive, "complete", None);
    assert!(matches!(
        result,
        Err(ApplyError::ResourceHash(resource)) if resource == "a"
    ));
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

#[test]
fn progress_brackets_the_apply() {
    let payload = pattern(4096);
    let manifest = format!(
        "file-resource \"a\" {{\n length=4096\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n on-resource \"a\" {{ funlist={{\"2\",\"raw_write\",\"0\"}} }}\n}}\n",
        sha_hex(&payload)
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("a", &payload)]);

    let (_, result, reports) = run(archive, "complete", None);
    result.unwrap();

    assert_eq!(reports.first(), Some(&0), "0 must be reported first");
    assert_eq!(reports.last(), Some(&100), "100 must be reported last");
    assert!(reports.windows(2).all(|w| w[0] < w[1]), "reports must increase");
    assert!(reports.iter().all(|&p| p <= 100));
}

#[test]
fn progress_is_bracketed_even_for_empty_tasks() {
    let archive = build_archive(None, b"task \"complete\" { }", &[]);
    let (_, result, reports) = run(archive, "complete", None);
    result.unwrap();
    assert_eq!(reports, vec![0, 100]);
}

// ---------------------------------------------------------------------------
// FAT operations
// ---------------------------------------------------------------------------

/// Read-only window over a region of the sink, for mounting the result.
struct PartitionView {
    file: File,
    base: u64,
    pos: u64,
}

impl PartitionView {
    fn open(sink: &NamedTempFile, block_offset: u64) -> Self {
        Self {
            file: reopen(sink),
            base: block_offset * 512,
            pos: 0,
        }
    }
}

impl Read for PartitionView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.file.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for PartitionView {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.base + self.pos))?;
        let n = self.file.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PartitionView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let end = self.file.metadata()?.len().saturating_sub(self.base);
        let new = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => end as i64 + d,
        };
        assert!(new >= 0);
        self.pos = new as u64;
        Ok(self.pos)
    }
}

fn read_fat_file(sink: &NamedTempFile, block_offset: u64, name: &str) -> Vec<u8> {
    let fs = fatfs::FileSystem::new(
        PartitionView::open(sink, block_offset),
        fatfs::FsOptions::new(),
    )
    .expect("FAT volume should mount");
    let mut data = Vec::new();
    fs.root_dir()
        .open_file(name)
        .unwrap_or_else(|e| panic!("open {name}: {e}"))
        .read_to_end(&mut data)
        .unwrap();
    data
}

#[test]
fn fat_cache_rebinding_persists_both_volumes() {
    let hello = b"hello, world".to_vec();
    let deep = b"deep".to_vec();
    let manifest = format!(
        "meta-creation-date=\"2026-08-01T00:00:00Z\"\n\
         file-resource \"hello.txt\" {{\n length={}\n sha256=\"{}\"\n}}\n\
         file-resource \"deep.txt\" {{\n length={}\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n \
           on-init {{ funlist={{\"3\",\"fat_mkfs\",\"2048\",\"8192\",\"3\",\"fat_mkfs\",\"18432\",\"8192\"}} }}\n \
           on-resource \"hello.txt\" {{ funlist={{\"3\",\"fat_write\",\"2048\",\"hello.txt\"}} }}\n \
           on-resource \"deep.txt\" {{ funlist={{\"3\",\"fat_write\",\"18432\",\"deep.txt\"}} }}\n}}\n",
        hello.len(),
        sha_hex(&hello),
        deep.len(),
        sha_hex(&deep),
    );
    let archive = build_archive(
        None,
        manifest.as_bytes(),
        &[("hello.txt", &hello), ("deep.txt", &deep)],
    );

    let (sink, result, _) = run(archive, "complete", None);
    result.expect("FAT apply should succeed");

    // The first volume's writes must have been flushed when the cache was
    // rebound to the second offset; the final negative-offset flush drains
    // the second.
    assert_eq!(read_fat_file(&sink, 2048, "hello.txt"), hello);
    assert_eq!(read_fat_file(&sink, 18432, "deep.txt"), deep);
}

#[test]
fn fat_timestamps_come_from_the_creation_date() {
    let hello = b"stamped".to_vec();
    let manifest = format!(
        "meta-creation-date=\"2026-08-01T00:00:00Z\"\n\
         file-resource \"f\" {{\n length={}\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n \
           on-init {{ funlist={{\"3\",\"fat_mkfs\",\"2048\",\"8192\"}} }}\n \
           on-resource \"f\" {{ funlist={{\"3\",\"fat_write\",\"2048\",\"f.txt\"}} }}\n}}\n",
        hello.len(),
        sha_hex(&hello),
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("f", &hello)]);
    let (sink, result, _) = run(archive, "complete", None);
    result.unwrap();

    let fs = fatfs::FileSystem::new(
        PartitionView::open(&sink, 2048),
        fatfs::FsOptions::new(),
    )
    .unwrap();
    let entry = fs
        .root_dir()
        .iter()
        .map(|e| e.unwrap())
        .find(|e| e.file_name() == "f.txt")
        .expect("f.txt should exist");
    assert_eq!(entry.modified().date.year, 2026);
}

#[test]
fn fat_file_operations_apply_in_order() {
    let data = b"payload!".to_vec();
    let manifest = format!(
        "file-resource \"d\" {{\n length={}\n sha256=\"{}\"\n}}\n\
         task \"complete\" {{\n \
           on-init {{ funlist={{\"3\",\"fat_mkfs\",\"2048\",\"8192\",\"3\",\"fat_mkdir\",\"2048\",\"cfg\",\"3\",\"fat_touch\",\"2048\",\"empty.txt\"}} }}\n \
           on-resource \"d\" {{ funlist={{\"3\",\"fat_write\",\"2048\",\"data.txt\"}} }}\n \
           on-finish {{ funlist={{\"4\",\"fat_cp\",\"2048\",\"data.txt\",\"copy.txt\",\"4\",\"fat_mv\",\"2048\",\"copy.txt\",\"renamed.txt\",\"3\",\"fat_rm\",\"2048\",\"empty.txt\"}} }}\n}}\n",
        data.len(),
        sha_hex(&data),
    );
    let archive = build_archive(None, manifest.as_bytes(), &[("d", &data)]);
    let (sink, result, _) = run(archive, "complete", None);
    result.expect("FAT file operations should succeed");

    assert_eq!(read_fat_file(&sink, 2048, "data.txt"), data);
    assert_eq!(read_fat_file(&sink, 2048, "renamed.txt"), data);

    let fs = fatfs::FileSystem::new(
        PartitionView::open(&sink, 2048),
        fatfs::FsOptions::new(),
    )
    .unwrap();
    let names: Vec<String> = fs
        .root_dir()
        .iter()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(names.contains(&"cfg".to_string()), "fat_mkdir result missing");
    assert!(
        !names.contains(&"empty.txt".to_string()),
        "fat_rm must remove the file"
    );
}

#[test]
fn final_flush_is_idempotent() {
    let sink = NamedTempFile::new().unwrap();
    let output = Output::from_file(reopen(&sink));
    let time = FixedTimeProvider::new(None);

    let mut fat = FatController::new(2 * 1024 * 1024);
    fat.bind(&output, 4, time).unwrap();
    fat.format(2048).unwrap();

    fat.bind(&output, -1, time).unwrap();
    let first = sink_bytes(&sink);
    assert!(!first.is_empty(), "flush must persist the formatted volume");

    fat.bind(&output, -1, time).unwrap();
    assert_eq!(sink_bytes(&sink), first, "second flush must change nothing");
}

// ---------------------------------------------------------------------------
// MBR write action
// ---------------------------------------------------------------------------

#[test]
fn mbr_write_places_the_partition_table() {
    let manifest = "\
mbr \"mbr-a\" {
    partition 0 {
        block-offset=63
        block-count=1000
        type=0xc
        boot=true
    }
    partition 1 {
        block-offset=1063
        block-count=8192
        type=0x83
    }
}
task \"complete\" {
    on-finish { funlist={\"2\",\"mbr_write\",\"mbr-a\"} }
}
";
    let archive = build_archive(None, manifest.as_bytes(), &[]);
    let (sink, result, _) = run(archive, "complete", None);
    result.unwrap();

    let bytes = sink_bytes(&sink);
    assert_eq!(bytes.len(), 512);
    let parts = mbr::decode(&bytes).expect("valid MBR");
    assert_eq!(parts[0].block_offset, 63);
    assert_eq!(parts[0].partition_type, 0x0c);
    assert!(parts[0].boot);
    assert_eq!(parts[1].block_offset, 1063);
    assert_eq!(parts[1].block_count, 8192);
}
