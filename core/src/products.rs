//! Per-channel map products, written off the scanning thread.
//!
//! Every significant channel yields one interpolated time-frequency map
//! per plot duration and tiling (whitened and raw).  A fixed pool of
//! worker threads serialises them to `plots/` while the orchestrator moves
//! on to the next channel.  Workers own their input: each receives
//! immutable [`MapProduct`] snapshots over its own channel and reports a
//! [`ProductMessage`] back.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use ndarray::Array2;

use crate::qtransform::Spectrogram;

const QMAP_MAGIC: &[u8; 4] = b"QMAP";

/// Errors raised while writing or reading a map file.
#[derive(Debug, thiserror::Error)]
pub enum ProductError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a q-map file", .0.display())]
    BadMagic(PathBuf),
}

/// Which tiling a map was interpolated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Whitened,
    Raw,
}

impl MapKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MapKind::Whitened => "qscan_whitened",
            MapKind::Raw => "qscan_raw",
        }
    }
}

/// One map to be written.
#[derive(Clone, Debug)]
pub struct MapProduct {
    pub channel: String,
    pub kind: MapKind,
    /// Plot duration in seconds.
    pub duration: f64,
    /// Colour-scale ceiling carried into the file header.
    pub snr_threshold: f64,
    pub spectrogram: Spectrogram,
}

impl MapProduct {
    /// `<chan>-<kind>-<duration>.qmap`, with `-` in the channel name
    /// replaced by `_` and `:` by `-`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.qmap",
            self.channel.replace('-', "_").replace(':', "-"),
            self.kind.tag(),
            self.duration
        )
    }
}

/// Completion report from a worker.
#[derive(Clone, Debug, PartialEq)]
pub enum ProductMessage {
    Written { channel: String, path: PathBuf },
    Failed { channel: String, error: String },
}

/// Counts of finished products.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProductTally {
    pub written: usize,
    pub failed: usize,
}

impl ProductTally {
    pub fn record(&mut self, message: &ProductMessage) {
        match message {
            ProductMessage::Written { .. } => self.written += 1,
            ProductMessage::Failed { channel, error } => {
                warn!("Failed to write map for {}: {}", channel, error);
                self.failed += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Write `product` to `path`.
///
/// Layout (little-endian): `"QMAP"`, `u32 nt`, `u32 nf`, `f64 t0`,
/// `f64 dt`, `f64 snr_threshold`, `nf × f64` frequencies, then
/// `nt × nf × f64` energies in row-major (time-major) order.
pub fn write_map(path: &Path, product: &MapProduct) -> Result<(), ProductError> {
    let io_err = |source| ProductError::Io {
        path: path.to_path_buf(),
        source,
    };
    let spec = &product.spectrogram;
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    let mut put = |bytes: &[u8]| out.write_all(bytes).map_err(io_err);

    put(QMAP_MAGIC)?;
    put(&(spec.nt() as u32).to_le_bytes())?;
    put(&(spec.nf() as u32).to_le_bytes())?;
    put(&spec.t0.to_le_bytes())?;
    put(&spec.dt.to_le_bytes())?;
    put(&product.snr_threshold.to_le_bytes())?;
    for f in &spec.frequencies {
        put(&f.to_le_bytes())?;
    }
    for v in spec.values.iter() {
        put(&v.to_le_bytes())?;
    }
    out.flush().map_err(io_err)
}

/// Read a map written by [`write_map`]; returns the spectrogram and the
/// stored SNR threshold.
pub fn read_map(path: &Path) -> Result<(Spectrogram, f64), ProductError> {
    let io_err = |source| ProductError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    if &magic != QMAP_MAGIC {
        return Err(ProductError::BadMagic(path.to_path_buf()));
    }

    let mut u32_buf = [0u8; 4];
    let mut f64_buf = [0u8; 8];
    let mut read_u32 = |r: &mut BufReader<File>| -> Result<usize, ProductError> {
        r.read_exact(&mut u32_buf).map_err(io_err)?;
        Ok(u32::from_le_bytes(u32_buf) as usize)
    };
    let nt = read_u32(&mut reader)?;
    let nf = read_u32(&mut reader)?;
    let mut read_f64 = |r: &mut BufReader<File>| -> Result<f64, ProductError> {
        r.read_exact(&mut f64_buf).map_err(io_err)?;
        Ok(f64::from_le_bytes(f64_buf))
    };
    let t0 = read_f64(&mut reader)?;
    let dt = read_f64(&mut reader)?;
    let snr_threshold = read_f64(&mut reader)?;
    let frequencies = (0..nf).map(|_| read_f64(&mut reader)).collect::<Result<Vec<_>, _>>()?;
    let values = (0..nt * nf).map(|_| read_f64(&mut reader)).collect::<Result<Vec<_>, _>>()?;
    let values = Array2::from_shape_vec((nt, nf), values).map_err(|e| ProductError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;

    Ok((
        Spectrogram {
            t0,
            dt,
            frequencies,
            values,
        },
        snr_threshold,
    ))
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Fixed-size pool of map writers.
pub struct ProductPool {
    senders: Vec<mpsc::Sender<MapProduct>>,
    done: mpsc::Receiver<ProductMessage>,
    workers: Vec<JoinHandle<()>>,
    next: usize,
    submitted: usize,
    received: usize,
}

impl ProductPool {
    /// Start `nproc` (at least one) workers writing into `out_dir`.
    pub fn new(out_dir: impl Into<PathBuf>, nproc: usize) -> Self {
        let out_dir = out_dir.into();
        let (done_tx, done) = mpsc::channel();
        let mut senders = Vec::new();
        let mut workers = Vec::new();

        for id in 0..nproc.max(1) {
            let (tx, rx) = mpsc::channel::<MapProduct>();
            let done_tx = done_tx.clone();
            let out_dir = out_dir.clone();
            workers.push(thread::spawn(move || {
                for product in rx {
                    let path = out_dir.join(product.file_name());
                    let message = match write_map(&path, &product) {
                        Ok(()) => {
                            debug!("worker {} wrote {}", id, path.display());
                            ProductMessage::Written {
                                channel: product.channel,
                                path,
                            }
                        }
                        Err(e) => ProductMessage::Failed {
                            channel: product.channel,
                            error: e.to_string(),
                        },
                    };
                    if done_tx.send(message).is_err() {
                        // Pool dropped; nobody is listening.
                        break;
                    }
                }
            }));
            senders.push(tx);
        }

        Self {
            senders,
            done,
            workers,
            next: 0,
            submitted: 0,
            received: 0,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue `product` on the next worker in turn.
    pub fn submit(&mut self, product: MapProduct) {
        let worker = self.next % self.senders.len();
        self.next += 1;
        let channel = product.channel.clone();
        if self.senders[worker].send(product).is_err() {
            warn!("Map worker {} has exited; dropping product for {}", worker, channel);
            return;
        }
        self.submitted += 1;
    }

    /// Completion messages that have arrived so far, without blocking.
    pub fn poll(&mut self) -> Vec<ProductMessage> {
        let messages: Vec<ProductMessage> = self.done.try_iter().collect();
        self.received += messages.len();
        messages
    }

    /// Products submitted but not yet reported.
    pub fn pending(&self) -> usize {
        self.submitted - self.received
    }

    /// Close the queues, wait for every worker, and return the remaining
    /// completion messages.
    pub fn finish(mut self) -> Vec<ProductMessage> {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A map worker panicked");
            }
        }
        self.done.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(channel: &str, kind: MapKind, duration: f64) -> MapProduct {
        let values = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f64);
        MapProduct {
            channel: channel.to_string(),
            kind,
            duration,
            snr_threshold: 5.5,
            spectrogram: Spectrogram {
                t0: -2.0,
                dt: 1.0,
                frequencies: vec![10.0, 20.0, 40.0],
                values,
            },
        }
    }

    #[test]
    fn test_file_name() {
        let p = product("L1:ASC-AS_A_RF45_Q_YAW_OUT_DQ", MapKind::Whitened, 4.0);
        assert_eq!(p.file_name(), "L1-ASC_AS_A_RF45_Q_YAW_OUT_DQ-qscan_whitened-4.qmap");
        let p = product("L1:GDS-CALIB_STRAIN", MapKind::Raw, 0.5);
        assert_eq!(p.file_name(), "L1-GDS_CALIB_STRAIN-qscan_raw-0.5.qmap");
    }

    #[test]
    fn test_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = product("X1:A", MapKind::Raw, 4.0);
        let path = dir.path().join(p.file_name());
        write_map(&path, &p).unwrap();
        let (spec, snr) = read_map(&path).unwrap();
        assert_eq!(snr, 5.5);
        assert_eq!(spec.frequencies, p.spectrogram.frequencies);
        assert_eq!(spec.values, p.spectrogram.values);
        assert_eq!(spec.t0, -2.0);
    }

    #[test]
    fn test_pool_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = ProductPool::new(dir.path(), 3);
        assert_eq!(pool.workers(), 3);
        for i in 0..10 {
            pool.submit(product(&format!("X1:CHAN_{}", i), MapKind::Whitened, 1.0));
        }

        let mut tally = ProductTally::default();
        for m in pool.poll() {
            tally.record(&m);
        }
        for m in pool.finish() {
            tally.record(&m);
        }
        assert_eq!(tally, ProductTally { written: 10, failed: 0 });
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 10);
    }

    #[test]
    fn test_pool_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = ProductPool::new(dir.path().join("missing"), 1);
        pool.submit(product("X1:A", MapKind::Raw, 1.0));
        let messages = pool.finish();
        assert!(matches!(messages.as_slice(), [ProductMessage::Failed { .. }]));
    }
}
