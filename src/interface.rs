//! The `native_engine` Python module. Only [`Engine`] is exposed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use fs::RelativePath;
use hashing::{Digest, Fingerprint};
use process_execution::{Context, Process};
use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError};
use crate::telemetry;

create_exception!(native_engine, EngineException, PyException);

impl From<EngineError> for PyErr {
    fn from(e: EngineError) -> Self {
        EngineException::new_err(e.to_string())
    }
}

fn parse_digest(hash: &str, size_bytes: usize) -> PyResult<Digest> {
    let fingerprint =
        Fingerprint::from_hex_string(hash).map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(Digest::new(fingerprint, size_bytes))
}

fn relative(path: &str) -> PyResult<RelativePath> {
    RelativePath::new(path).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Result of one process run.
#[pyclass(name = "ProcessResult", frozen)]
#[derive(Clone, Debug)]
pub struct PyProcessResult {
    #[pyo3(get)]
    pub exit_code: i32,
    /// Hex hash of the captured output tree.
    #[pyo3(get)]
    pub output_digest: String,
    #[pyo3(get)]
    pub output_size_bytes: usize,
    #[pyo3(get)]
    pub cached: bool,
    stdout: Bytes,
    stderr: Bytes,
}

#[pymethods]
impl PyProcessResult {
    #[getter]
    fn stdout<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.stdout)
    }

    #[getter]
    fn stderr<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.stderr)
    }

    fn __repr__(&self) -> String {
        format!(
            "ProcessResult(exit_code={}, output_digest='{}', cached={})",
            self.exit_code,
            self.output_digest,
            if self.cached { "True" } else { "False" }
        )
    }
}

#[pyclass(name = "Engine", frozen)]
pub struct PyEngine {
    engine: Engine,
}

#[pymethods]
impl PyEngine {
    /// Build an engine from `engine.toml` (defaults if the file is absent).
    #[new]
    #[pyo3(signature = (config_path = None))]
    fn new(config_path: Option<PathBuf>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => EngineConfig::load(&path).map_err(EngineError::from)?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            engine: Engine::new(config)?,
        })
    }

    /// Store file contents, returning `(hash, size_bytes)`.
    fn store_bytes(&self, py: Python<'_>, data: &[u8]) -> PyResult<(String, usize)> {
        let bytes = Bytes::copy_from_slice(data);
        let engine = &self.engine;
        let digest = py.detach(|| engine.executor().block_on(engine.store_bytes(bytes)))?;
        Ok((digest.hash.to_hex(), digest.size_bytes))
    }

    fn load_bytes<'py>(
        &self,
        py: Python<'py>,
        hash: &str,
        size_bytes: usize,
    ) -> PyResult<Option<Bound<'py, PyBytes>>> {
        let digest = parse_digest(hash, size_bytes)?;
        let engine = &self.engine;
        let loaded = py.detach(|| engine.executor().block_on(engine.load_bytes(digest)))?;
        Ok(loaded.map(|bytes| PyBytes::new(py, &bytes)))
    }

    /// Run `argv` in a sandbox and return its captured result.
    #[pyo3(signature = (
        argv,
        env = None,
        output_files = Vec::new(),
        output_directories = Vec::new(),
        timeout_secs = None,
        description = String::new(),
        build_id = String::new(),
    ))]
    #[allow(clippy::too_many_arguments)]
    fn run_process(
        &self,
        py: Python<'_>,
        argv: Vec<String>,
        env: Option<BTreeMap<String, String>>,
        output_files: Vec<String>,
        output_directories: Vec<String>,
        timeout_secs: Option<f64>,
        description: String,
        build_id: String,
    ) -> PyResult<PyProcessResult> {
        let mut process = Process::new(argv)
            .env(env.unwrap_or_default())
            .output_files(
                output_files
                    .iter()
                    .map(|p| relative(p))
                    .collect::<PyResult<_>>()?,
            )
            .output_directories(
                output_directories
                    .iter()
                    .map(|p| relative(p))
                    .collect::<PyResult<_>>()?,
            )
            .description(description);
        if let Some(secs) = timeout_secs {
            let timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| PyValueError::new_err(format!("invalid timeout {secs}: {e}")))?;
            process = process.timeout(timeout);
        }

        let engine = &self.engine;
        let result = py.detach(|| {
            engine.executor().block_on(async {
                let result = engine.run_process(Context::new(build_id), process).await?;
                let stdout = engine.load_bytes(result.stdout_digest).await?;
                let stderr = engine.load_bytes(result.stderr_digest).await?;
                Ok::<_, EngineError>((result, stdout, stderr))
            })
        });
        let (result, stdout, stderr) = result?;
        Ok(PyProcessResult {
            exit_code: result.exit_code,
            output_digest: result.output_directory.hash.to_hex(),
            output_size_bytes: result.output_directory.size_bytes,
            cached: result.metadata.source == process_execution::ProcessResultSource::Cached,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        })
    }

    /// Resolve a `pex_binary` entry point, returning `(module, function)` or
    /// `None` for `<none>`.
    #[pyo3(signature = (value, spec_path, build_root, source_roots))]
    fn resolve_entry_point(
        &self,
        py: Python<'_>,
        value: &str,
        spec_path: &str,
        build_root: PathBuf,
        source_roots: Vec<String>,
    ) -> PyResult<Option<(String, Option<String>)>> {
        let spec_path = relative(spec_path)?;
        let source_roots = source_roots
            .iter()
            .map(|r| relative(r))
            .collect::<PyResult<Vec<_>>>()?;
        let engine = &self.engine;
        let resolved = py.detach(|| {
            engine.executor().block_on(engine.resolve_entry_point(
                value,
                spec_path,
                &build_root,
                source_roots,
            ))
        })?;
        Ok(resolved
            .entry_point
            .map(|entry_point| (entry_point.module, entry_point.function)))
    }

    fn __repr__(&self) -> String {
        format!(
            "Engine(store='{}')",
            self.engine.config().store.path.display()
        )
    }
}

#[pymodule]
fn native_engine(m: &Bound<'_, PyModule>) -> PyResult<()> {
    telemetry::init();

    m.add_class::<PyEngine>()?;
    m.add_class::<PyProcessResult>()?;
    m.add("EngineException", m.py().get_type::<EngineException>())?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
