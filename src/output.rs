use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use crate::block::Block;
use crate::cell::CellGeometry;
use crate::error::SolverError;
use crate::geometry::{Face, Vector3d};
use crate::state::FlowState;




/// Output index of the snapshot written when a run ends, normally or not.
///
pub const FINAL_OUTPUT_INDEX: usize = 9999;




/// A file being written, plain or gzipped. Call `finish` when done: the gzip
/// trailer is only written there, and errors from it would be lost on drop.
///
pub enum FileWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Plain(mut file) => file.flush(),
            FileWriter::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Plain(file) => file.write(buf),
            FileWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Plain(file) => file.flush(),
            FileWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Open a file for writing, creating its directory, optionally through a
/// gzip encoder.
///
pub fn create_writer(path: &Path, compressed: bool) -> io::Result<FileWriter> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = BufWriter::new(File::create(path)?);

    if compressed {
        Ok(FileWriter::Gzip(GzEncoder::new(file, Compression::default())))
    } else {
        Ok(FileWriter::Plain(file))
    }
}

/// Open a file for reading, optionally through a gzip decoder.
///
pub fn open_reader(path: &Path, compressed: bool) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;

    if compressed {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Format a float the way C's `%e` does: six decimals and a signed,
/// two-digit exponent.
///
pub fn format_exp(x: f64) -> String {
    let s = format!("{:.6e}", x);

    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => s,
    }
}




/// The state of one interior cell as written to a flow snapshot.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub geom: CellGeometry,
    pub fs: FlowState,
}

/// The flow state of every interior cell of one block, in row-major order.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub block: usize,
    pub sim_time: f64,
    pub dimensions: usize,
    pub shape: (usize, usize, usize),
    pub cells: Vec<CellRecord>,
}

/// Cell positions of one block, for moving-grid runs.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub block: usize,
    pub sim_time: f64,
    pub offset: Vector3d,
    pub positions: Vec<Vector3d>,
}




// ============================================================================
impl BlockSnapshot {

    pub fn from_block(block: &Block, sim_time: f64) -> Self {
        Self {
            block: block.id(),
            sim_time,
            dimensions: block.dimensions(),
            shape: block.data.interior().dim(),
            cells: block
                .data
                .interior_cells()
                .map(|c| CellRecord { geom: c.geom[0], fs: c.fs.clone() })
                .collect(),
        }
    }

    /// Load this snapshot into a block of the same shape, and encode the
    /// conserved state from it.
    ///
    pub fn apply(&self, block: &mut Block) -> Result<(), SolverError> {
        if self.shape != block.data.interior().dim() || self.block != block.id() {
            return Err(SolverError::Snapshot {
                path: PathBuf::new(),
                reason: format!("snapshot of block {} {:?} does not fit block {} {:?}",
                    self.block, self.shape, block.id(), block.data.interior().dim()),
            });
        }
        let indexes: Vec<usize> = block
            .data
            .interior()
            .iter()
            .map(|index| block.data.cell_index(index))
            .collect();

        for (n, record) in indexes.into_iter().zip(&self.cells) {
            let cell = &mut block.data.cells[n];
            cell.fs = record.fs.clone();
            cell.geom[0] = record.geom;
            cell.encode_conserved();
        }
        Ok(())
    }
}

fn read_cbor<T: DeserializeOwned>(path: &Path, compressed: bool) -> Result<T, SolverError> {
    let reader = open_reader(path, compressed).map_err(|e| SolverError::io(path, e))?;

    ciborium::de::from_reader(reader).map_err(|e| SolverError::Snapshot {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

pub fn read_block_snapshot(path: &Path, compressed: bool) -> Result<BlockSnapshot, SolverError> {
    read_cbor(path, compressed)
}




/// Writes every artifact of a run beneath the run directory: snapshots,
/// surface data, cell histories, the time-index ledger and the finish
/// summary.
///
pub struct OutputWriter {
    run_dir: PathBuf,
    job: String,
    compressed: bool,
    ledger: Option<BufWriter<File>>,
}

impl OutputWriter {

    pub fn new(run_dir: impl Into<PathBuf>, job: &str, compressed: bool) -> Self {
        Self {
            run_dir: run_dir.into(),
            job: job.to_owned(),
            compressed,
            ledger: None,
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    fn snapshot_path(&self, kind: &str, block: usize, tindx: usize, compressed: bool) -> PathBuf {
        let name = format!("{}.{}.b{:04}.t{:04}{}", self.job, kind, block, tindx, if compressed { ".gz" } else { "" });
        self.run_dir.join(kind).join(format!("t{:04}", tindx)).join(name)
    }

    pub fn flow_path(&self, block: usize, tindx: usize) -> PathBuf {
        self.snapshot_path("flow", block, tindx, self.compressed)
    }

    pub fn grid_path(&self, block: usize, tindx: usize) -> PathBuf {
        self.snapshot_path("grid", block, tindx, self.compressed)
    }

    pub fn heat_path(&self, block: usize, face: Face, tindx: usize) -> PathBuf {
        let name = format!("{}.heat.b{:04}.s{:04}.t{:04}{}",
            self.job, block, face.index(), tindx, if self.compressed { ".gz" } else { "" });
        self.run_dir.join("heat").join(format!("t{:04}", tindx)).join(name)
    }

    pub fn vel_path(&self, block: usize, face: Face, tindx: usize) -> PathBuf {
        let name = format!("{}.vel.b{:04}.s{:04}.t{:04}", self.job, block, face.index(), tindx);
        self.run_dir.join("vel").join(format!("t{:04}", tindx)).join(name)
    }

    pub fn hist_path(&self, block: usize) -> PathBuf {
        self.run_dir.join("hist").join(format!("{}.hist.b{:04}", self.job, block))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.times", self.job))
    }

    pub fn finish_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.finish", self.job))
    }

    pub fn control_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}.control", self.job))
    }

    fn write_cbor<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), SolverError> {
        let mut writer = create_writer(path, self.compressed).map_err(|e| SolverError::io(path, e))?;

        ciborium::ser::into_writer(value, &mut writer).map_err(|e| SolverError::Snapshot {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        writer.finish().map_err(|e| SolverError::io(path, e))
    }

    pub fn write_flow(&self, block: &Block, tindx: usize, sim_time: f64) -> Result<(), SolverError> {
        self.write_cbor(&self.flow_path(block.id(), tindx), &BlockSnapshot::from_block(block, sim_time))
    }

    /// Load a block from its flow snapshot and return the simulation time
    /// the snapshot was written at.
    ///
    pub fn read_flow(&self, block: &mut Block, tindx: usize) -> Result<f64, SolverError> {
        let path = self.flow_path(block.id(), tindx);
        let snapshot = read_block_snapshot(&path, self.compressed)?;

        snapshot.apply(block).map_err(|e| match e {
            SolverError::Snapshot { reason, .. } => SolverError::Snapshot { path, reason },
            e => e,
        })?;
        Ok(snapshot.sim_time)
    }

    pub fn write_grid(&self, block: &Block, tindx: usize, sim_time: f64) -> Result<(), SolverError> {
        let grid = GridSnapshot {
            block: block.id(),
            sim_time,
            offset: block.data.grid_offset(0),
            positions: block.data.interior_cells().map(|c| c.geom[0].position).collect(),
        };
        self.write_cbor(&self.grid_path(block.id(), tindx), &grid)
    }

    /// Move a block to where its grid snapshot places it, and return the
    /// simulation time the snapshot was written at.
    ///
    pub fn read_grid(&self, block: &mut Block, tindx: usize) -> Result<f64, SolverError> {
        let path = self.grid_path(block.id(), tindx);
        let grid: GridSnapshot = read_cbor(&path, self.compressed)?;
        let count = block.data.interior().iter().count();

        if grid.block != block.id() || grid.positions.len() != count {
            return Err(SolverError::Snapshot {
                reason: format!("grid of block {} with {} cells does not fit block {} with {}",
                    grid.block, grid.positions.len(), block.id(), count),
                path,
            });
        }
        block.data.set_grid_offset(grid.offset);
        Ok(grid.sim_time)
    }

    /// Write the surface heat flux of every face that keeps one.
    ///
    pub fn write_heat_flux(&self, block: &Block, tindx: usize, sim_time: f64) -> Result<(), SolverError> {
        for face in Face::active(block.dimensions()) {
            let bc = block.bc(*face);

            if bc.heat_flux().is_some() {
                bc.write_surface_heat_flux(&self.heat_path(block.id(), *face, tindx), sim_time, self.compressed)?;
            }
        }
        Ok(())
    }

    /// Read back the heat flux files of a previous run into the faces that
    /// keep one.
    ///
    pub fn read_heat_flux(&self, block: &mut Block, tindx: usize) -> Result<(), SolverError> {
        let dims = block.dimensions();

        for face in Face::active(dims) {
            let path = self.heat_path(block.id(), *face, tindx);

            if block.bc(*face).heat_flux().is_some() {
                block.bc_mut(*face).read_surface_heat_flux(&path, dims, self.compressed)?;
            }
        }
        Ok(())
    }

    pub fn write_vertex_velocities(&self, block: &Block, tindx: usize, sim_time: f64) -> Result<(), SolverError> {
        let dims = block.dimensions();

        for face in Face::active(dims) {
            let path = self.vel_path(block.id(), *face, tindx);
            block.bc(*face).write_vertex_velocities(&block.data, *face, &path, sim_time, dims)?;
        }
        Ok(())
    }

    /// Create the history file of a block with its header, unless it exists
    /// already (a resumed run appends to it).
    ///
    pub fn write_history_header(&self, block: &Block) -> Result<(), SolverError> {
        let path = self.hist_path(block.id());

        if block.hist_cells.is_empty() || path.exists() {
            return Ok(());
        }
        let mut out = create_writer(&path, false).map_err(|e| SolverError::io(&path, e))?;
        writeln!(out, "# sim_time i j k pos.x pos.y pos.z rho p T vel.x vel.y vel.z")
            .and_then(|()| out.finish())
            .map_err(|e| SolverError::io(&path, e))
    }

    pub fn write_history(&self, block: &Block, sim_time: f64) -> Result<(), SolverError> {
        if block.hist_cells.is_empty() {
            return Ok(());
        }
        let path = self.hist_path(block.id());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SolverError::io(&path, e))?;
        let mut out = BufWriter::new(file);

        for index in &block.hist_cells {
            if !block.data.interior().contains(*index) {
                continue;
            }
            let c = block.data.cell(*index);
            let (x, v) = (c.geom[0].position, c.fs.vel);
            writeln!(out, "{} {} {} {} {} {} {} {} {} {} {} {} {}",
                format_exp(sim_time), index.0, index.1, index.2,
                format_exp(x.x), format_exp(x.y), format_exp(x.z),
                format_exp(c.fs.gas.rho), format_exp(c.fs.gas.p), format_exp(c.fs.gas.temperature()),
                format_exp(v.x), format_exp(v.y), format_exp(v.z))
                .map_err(|e| SolverError::io(&path, e))?;
        }
        out.flush().map_err(|e| SolverError::io(&path, e))
    }

    /// Open the time-index ledger, appending to an existing one on resume.
    ///
    pub fn open_ledger(&mut self, append: bool) -> Result<(), SolverError> {
        let path = self.ledger_path();
        fs::create_dir_all(&self.run_dir).map_err(|e| SolverError::io(&self.run_dir, e))?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|e| SolverError::io(&path, e))?;
        let mut ledger = BufWriter::new(file);

        if !append {
            writeln!(ledger, "# tindx sim_time dt_global").map_err(|e| SolverError::io(&path, e))?;
        }
        self.ledger = Some(ledger);
        Ok(())
    }

    pub fn append_ledger(&mut self, tindx: usize, sim_time: f64, dt_global: f64) -> Result<(), SolverError> {
        let path = self.ledger_path();

        if let Some(ledger) = self.ledger.as_mut() {
            writeln!(ledger, "{:04} {} {}", tindx, format_exp(sim_time), format_exp(dt_global))
                .and_then(|()| ledger.flush())
                .map_err(|e| SolverError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn flush_ledger(&mut self) -> Result<(), SolverError> {
        let path = self.ledger_path();

        if let Some(ledger) = self.ledger.as_mut() {
            ledger.flush().map_err(|e| SolverError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn write_finish(&self, final_time: f64, dt: f64, steps: usize) -> Result<(), SolverError> {
        let path = self.finish_path();
        let text = format!(
            "[simulation_end]\nfinal_time = {}\ndt = {}\nno_steps = {}\n",
            format_exp(final_time), format_exp(dt), steps);

        fs::write(&path, text).map_err(|e| SolverError::io(&path, e))?;
        info!("wrote {}", path.display());
        Ok(())
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::block::BlockMesh;
    use crate::gas::IdealGas;

    fn block() -> Block {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::new(1.0, 0.0, 0.0), spacing: Vector3d::new(0.1, 0.2, 1.0) };
        let mut b = Block::new(3, 2, (4, 3, 1), mesh, &gm);
        b.data.fill(|x| FlowState::from_pvt(&gm, 1.0e5 * x.x, Vector3d::new(x.y, 1.0 / 3.0, 0.0), 300.0 + x.x * x.y, None).unwrap());
        b
    }

    #[test]
    fn exponent_format_matches_c() {
        assert_eq!(format_exp(1.0e-3), "1.000000e-03");
        assert_eq!(format_exp(123456.0), "1.234560e+05");
        assert_eq!(format_exp(0.0), "0.000000e+00");
        assert_eq!(format_exp(-2.5e-120), "-2.500000e-120");
    }

    #[test]
    fn finished_gzip_file_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/dir/notes.gz");
        let mut out = create_writer(&path, true).unwrap();
        writeln!(out, "first line").unwrap();
        writeln!(out, "second line").unwrap();
        out.finish().unwrap();

        let lines: Vec<String> = open_reader(&path, true).unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["first line", "second line"]);
    }

    #[test]
    fn grid_snapshot_moves_block_back_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputWriter::new(dir.path(), "job", true);
        let mut moved = block();
        moved.data.set_grid_offset(Vector3d::new(0.25, -0.5, 0.0));
        out.write_grid(&moved, 4, 2.0e-3).unwrap();

        let mut restored = block();
        assert_eq!(out.read_grid(&mut restored, 4).unwrap(), 2.0e-3);
        assert_eq!(restored.data.grid_offset(0), moved.data.grid_offset(0));
        assert_eq!(restored.data.grid_offset(1), moved.data.grid_offset(0));

        for (a, b) in restored.data.interior_cells().zip(moved.data.interior_cells()) {
            assert_eq!(a.geom[0].position, b.geom[0].position);
        }

        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.2, 1.0) };
        let mut other = Block::new(3, 2, (5, 3, 1), mesh, &gm);
        assert!(matches!(out.read_grid(&mut other, 4), Err(SolverError::Snapshot { .. })));
    }

    #[test]
    fn flow_snapshot_restores_conserved_state_exactly() {
        for compressed in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let out = OutputWriter::new(dir.path(), "job", compressed);
            let original = block();
            out.write_flow(&original, 2, 1.5e-3).unwrap();
            assert!(out.flow_path(3, 2).exists());

            let gm = IdealGas::default();
            let mut restored = Block::new(3, 2, (4, 3, 1), original.data.mesh.clone(), &gm);
            assert_eq!(out.read_flow(&mut restored, 2).unwrap(), 1.5e-3);

            for (a, b) in original.data.interior_cells().zip(restored.data.interior_cells()) {
                assert_eq!(a.u[0], b.u[0]);
                assert_eq!(a.fs, b.fs);
            }
        }
    }

    #[test]
    fn snapshot_paths_follow_the_naming_scheme() {
        let out = OutputWriter::new("/run", "duct", true);
        assert_eq!(out.flow_path(1, 9999), PathBuf::from("/run/flow/t9999/duct.flow.b0001.t9999.gz"));
        assert_eq!(out.heat_path(0, Face::South, 3), PathBuf::from("/run/heat/t0003/duct.heat.b0000.s0002.t0003.gz"));
        assert_eq!(out.hist_path(12), PathBuf::from("/run/hist/duct.hist.b0012"));
        assert_eq!(out.ledger_path(), PathBuf::from("/run/duct.times"));
    }

    #[test]
    fn ledger_and_finish_files_are_formatted() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = OutputWriter::new(dir.path(), "job", false);
        out.open_ledger(false).unwrap();
        out.append_ledger(0, 0.0, 1.0e-6).unwrap();
        out.append_ledger(1, 2.5e-4, 2.0e-7).unwrap();
        out.write_finish(2.5e-4, 2.0e-7, 1234).unwrap();

        let ledger = fs::read_to_string(out.ledger_path()).unwrap();
        let lines: Vec<_> = ledger.lines().collect();
        assert_eq!(lines[1], "0000 0.000000e+00 1.000000e-06");
        assert_eq!(lines[2], "0001 2.500000e-04 2.000000e-07");

        let finish = fs::read_to_string(out.finish_path()).unwrap();
        assert_eq!(finish, "[simulation_end]\nfinal_time = 2.500000e-04\ndt = 2.000000e-07\nno_steps = 1234\n");

        out.open_ledger(true).unwrap();
        out.append_ledger(2, 3.0e-4, 2.0e-7).unwrap();
        assert_eq!(fs::read_to_string(out.ledger_path()).unwrap().lines().count(), 4);
    }

    #[test]
    fn history_header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputWriter::new(dir.path(), "job", false);
        let mut b = block();
        b.hist_cells = vec![(1, 1, 0)];
        out.write_history_header(&b).unwrap();
        out.write_history(&b, 0.0).unwrap();
        out.write_history_header(&b).unwrap();
        out.write_history(&b, 1.0).unwrap();

        let text = fs::read_to_string(out.hist_path(3)).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with('#')).count(), 1);
        assert_eq!(text.lines().count(), 3);
    }
}
