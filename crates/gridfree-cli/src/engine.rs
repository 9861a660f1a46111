use crate::config::MdCommands;
use gridfree::core::restraint::Restraint;
use gridfree::workflows::md::{MdEngine, MdEngineError, MdJob};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

#[derive(Serialize)]
struct RestraintFile<'a> {
    unrestrained: bool,
    restraint: &'a [Restraint],
}

/// Drives the MD program through shell command templates.
#[derive(Debug, Clone)]
pub struct ShellEngine {
    commands: MdCommands,
}

impl ShellEngine {
    pub fn new(commands: MdCommands) -> Self {
        Self { commands }
    }

    /// Restraints in physical units, written next to the start frame.
    pub fn restraints_path(job: &MdJob<'_>) -> PathBuf {
        job.dir.join(format!("{}_restraints.toml", job.name))
    }

    fn render(template: &str, job: &MdJob<'_>, length: f64) -> String {
        template
            .replace("{node}", job.name)
            .replace("{dir}", &job.dir.display().to_string())
            .replace("{start}", &job.start_frame.display().to_string())
            .replace("{trajectory}", &job.trajectory.display().to_string())
            .replace("{restraints}", &Self::restraints_path(job).display().to_string())
            .replace("{length}", &length.to_string())
    }

    fn write_restraints(job: &MdJob<'_>) -> Result<(), MdEngineError> {
        let path = Self::restraints_path(job);
        let file = RestraintFile {
            unrestrained: job.restraints.is_empty(),
            restraint: &job.restraints,
        };
        let text = toml::to_string(&file).map_err(|e| MdEngineError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        std::fs::write(&path, text).map_err(|source| MdEngineError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn execute(&self, template: &str, job: &MdJob<'_>, length: f64) -> Result<(), MdEngineError> {
        let command = Self::render(template, job, length);
        debug!(node = %job.name, %command, "Running MD command");
        let output = Command::new(&self.commands.shell)
            .arg("-c")
            .arg(&command)
            .current_dir(job.dir)
            .output()
            .map_err(|source| MdEngineError::Io {
                path: self.commands.shell.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| format!("{} ({})", line.trim(), output.status))
            .unwrap_or_else(|| output.status.to_string());
        Err(MdEngineError::Command { command, message })
    }
}

impl MdEngine for ShellEngine {
    fn setup(&self, job: &MdJob<'_>) -> Result<(), MdEngineError> {
        Self::write_restraints(job)?;
        match &self.commands.setup {
            Some(template) => self.execute(template, job, job.sampling_length),
            None => Ok(()),
        }
    }

    fn preprocess(&self, job: &MdJob<'_>) -> Result<(), MdEngineError> {
        match &self.commands.preprocess {
            Some(template) => self.execute(template, job, job.sampling_length),
            None => Ok(()),
        }
    }

    fn extend(&self, job: &MdJob<'_>, length: f64) -> Result<(), MdEngineError> {
        match &self.commands.extend {
            Some(template) => {
                info!(node = %job.name, length, "Extending run");
                self.execute(template, job, length)
            }
            None => {
                debug!(node = %job.name, "No extend command configured");
                Ok(())
            }
        }
    }

    fn run(&self, job: &MdJob<'_>) -> Result<(), MdEngineError> {
        self.execute(&self.commands.run, job, job.sampling_length)?;
        if !job.trajectory.exists() {
            return Err(MdEngineError::MissingOutput(
                job.trajectory.display().to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfree::core::coords::{CoordinateSet, InternalCoordinate};
    use std::path::Path;
    use tempfile::tempdir;

    fn commands(run: &str) -> MdCommands {
        MdCommands {
            shell: "sh".to_string(),
            setup: Some("echo {node} > setup.txt".to_string()),
            preprocess: None,
            run: run.to_string(),
            extend: Some("echo {length} >> extend.txt".to_string()),
        }
    }

    fn job<'a>(dir: &'a Path, coords: &'a CoordinateSet, restraints: Vec<Restraint>) -> MdJob<'a> {
        MdJob {
            name: "node0007",
            dir,
            start_frame: dir.join("node0007_start.trr"),
            trajectory: dir.join("node0007.trr"),
            restraints,
            coordinates: coords,
            sampling_length: 50.0,
            extensions_counter: 0,
        }
    }

    fn distance_set() -> CoordinateSet {
        CoordinateSet::new(vec![InternalCoordinate::linear(0, 1)]).unwrap()
    }

    #[test]
    fn placeholders_are_filled_from_the_job() {
        let dir = tempdir().unwrap();
        let coords = distance_set();
        let job = job(dir.path(), &coords, Vec::new());
        let rendered = ShellEngine::render("mdrun -s {start} -o {trajectory} -nsteps {length} # {node}", &job, 50.0);
        assert_eq!(
            rendered,
            format!(
                "mdrun -s {} -o {} -nsteps 50 # node0007",
                dir.path().join("node0007_start.trr").display(),
                dir.path().join("node0007.trr").display()
            )
        );
    }

    #[test]
    fn setup_writes_restraints_and_runs_in_the_node_directory() {
        let dir = tempdir().unwrap();
        let coords = distance_set();
        let coord = coords.iter().next().unwrap();
        let restraint = Restraint::distance(coord, 0.1, 0.2, 0.3, 500.0).unwrap();
        let job = job(dir.path(), &coords, vec![restraint]);

        let engine = ShellEngine::new(commands("true"));
        engine.setup(&job).unwrap();

        let text = std::fs::read_to_string(ShellEngine::restraints_path(&job)).unwrap();
        assert!(text.contains("[[restraint]]"));
        assert!(text.contains("kind = \"distance\""));
        assert!(text.contains("unrestrained = false"));
        let marker = std::fs::read_to_string(dir.path().join("setup.txt")).unwrap();
        assert_eq!(marker.trim(), "node0007");
    }

    #[test]
    fn run_requires_the_trajectory() {
        let dir = tempdir().unwrap();
        let coords = distance_set();
        let job = job(dir.path(), &coords, Vec::new());

        let silent = ShellEngine::new(commands("true"));
        assert!(matches!(silent.run(&job), Err(MdEngineError::MissingOutput(_))));

        let writing = ShellEngine::new(commands("touch {trajectory}"));
        writing.run(&job).unwrap();
    }

    #[test]
    fn failing_command_reports_its_stderr() {
        let dir = tempdir().unwrap();
        let coords = distance_set();
        let job = job(dir.path(), &coords, Vec::new());
        let engine = ShellEngine::new(commands("echo 'fatal: no box' >&2; exit 3"));
        match engine.run(&job) {
            Err(MdEngineError::Command { message, .. }) => assert!(message.contains("fatal: no box")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn extend_passes_the_extension_length() {
        let dir = tempdir().unwrap();
        let coords = distance_set();
        let job = job(dir.path(), &coords, Vec::new());
        let engine = ShellEngine::new(commands("true"));
        engine.extend(&job, 25.0).unwrap();
        let text = std::fs::read_to_string(dir.path().join("extend.txt")).unwrap();
        assert_eq!(text.trim(), "25");
    }
}
