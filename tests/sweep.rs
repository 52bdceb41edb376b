use std::fs;
use std::path::Path;

use memsweep::kernel::Catalog;
use memsweep::memory::BackingRegion;
use memsweep::report::{OutputFormat, ResultRecord, ResultWriter};
use memsweep::sweep::{Sweep, SweepSettings};
use memsweep::system::cpu_info::{detect_features, GenericFeatures};
use memsweep::system::platform::cpu_ids;

const MIB: u64 = 1 << 20;

fn quick_settings() -> SweepSettings {
    SweepSettings {
        max_threads: 2,
        min_time: 0.01,
        target_time: 0.02,
        verify_permutation: true,
        ..SweepSettings::default()
    }
}

fn read_records(path: &Path) -> Vec<ResultRecord> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| ResultRecord::parse(l).unwrap())
        .collect()
}

#[test]
fn sweep_emits_consistent_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.txt");
    let backing = BackingRegion::allocate_single(16 * MIB).unwrap();
    let mut writer = ResultWriter::create(&path, OutputFormat::Text).unwrap().quiet();

    let catalog = Catalog::builtin();
    let names = ["ScanWrite64PtrUnrollLoop", "SkipRead64PtrSimpleLoop", "PermRead64UnrollLoop"];
    let kernels: Vec<_> = names.iter().map(|n| catalog.get(n).unwrap()).collect();
    let settings = quick_settings();
    let sizes = [4096, 65536];

    let probe = detect_features();
    let written = Sweep::new(&settings, &backing, &mut writer, "test-host".into(), cpu_ids())
        .with_sizes(&sizes)
        .run_all(&kernels, probe.as_ref())
        .unwrap();
    drop(writer);

    let records = read_records(&path);
    // three kernels, two thread counts, two sizes
    assert_eq!(records.len(), 12);
    assert_eq!(written, records.len());

    for (i, name) in names.iter().enumerate() {
        assert!(records[i * 4..(i + 1) * 4].iter().all(|r| r.funcname == *name));
    }

    for rec in &records {
        let kernel = catalog.get(&rec.funcname).unwrap();
        assert_eq!(rec.host, "test-host");
        assert_eq!(rec.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(rec.numahop, None);
        assert_eq!(rec.threadsize % kernel.alignment(), 0);
        assert_eq!(rec.testsize, rec.threadsize * rec.nthreads);
        assert!(rec.testsize >= rec.areasize);
        assert_eq!(
            rec.testvol,
            rec.testsize * rec.repeats * kernel.bytes_per_access / kernel.access_offset
        );
        assert_eq!(rec.testaccess, rec.testsize * rec.repeats / kernel.access_offset);
        assert!(rec.time >= settings.min_time, "{} too short: {}", rec.funcname, rec.time);
        let volume = rec.testvol as f64;
        assert!((rec.bandwidth * rec.time - volume).abs() <= volume * 1e-6);
        assert!((rec.rate * rec.testaccess as f64 - rec.time).abs() <= rec.time * 1e-6);
    }
}

#[test]
fn size_limits_and_missing_features_skip_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.txt");
    let backing = BackingRegion::allocate_single(16 * MIB).unwrap();
    let mut writer = ResultWriter::create(&path, OutputFormat::Text).unwrap().quiet();

    let catalog = Catalog::builtin();
    let kernels = catalog.filter_by_name(&["ScanRead64PtrSimpleLoop".to_string(), "256".to_string()]);
    let settings = SweepSettings {
        size_min: 8192,
        size_max: 16384,
        max_threads: 1,
        ..quick_settings()
    };

    Sweep::new(&settings, &backing, &mut writer, "h".into(), cpu_ids())
        .with_sizes(&[4096, 8192, 16384, 32768])
        .run_all(&kernels, &GenericFeatures)
        .unwrap();
    drop(writer);

    let records = read_records(&path);
    let sizes: Vec<u64> = records.iter().map(|r| r.areasize).collect();
    assert_eq!(sizes, vec![8192, 16384]);
    assert!(records.iter().all(|r| r.funcname == "ScanRead64PtrSimpleLoop"));
}

#[test]
fn configurations_that_do_not_fit_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.txt");
    // too small to space two threads 4 MiB + 16 KiB apart
    let backing = BackingRegion::allocate_single(6 * MIB).unwrap();
    let mut writer = ResultWriter::create(&path, OutputFormat::Text).unwrap().quiet();

    let catalog = Catalog::builtin();
    let kernel = catalog.get("ScanWrite64PtrSimpleLoop").unwrap();
    let settings = quick_settings();

    Sweep::new(&settings, &backing, &mut writer, "h".into(), cpu_ids())
        .with_sizes(&[4096, 8 * MIB])
        .run(kernel)
        .unwrap();
    drop(writer);

    let records = read_records(&path);
    assert_eq!(records.len(), 1);
    assert_eq!((records[0].nthreads, records[0].areasize), (1, 4096));
}
