/// Shell command templates driving the external MD program.
///
/// Templates may use the placeholders `{node}`, `{dir}`, `{start}`,
/// `{trajectory}`, `{restraints}` and `{length}`; they are run with the
/// node directory as working directory.
#[derive(Debug, Clone, PartialEq)]
pub struct MdCommands {
    pub shell: String,
    pub setup: Option<String>,
    pub preprocess: Option<String>,
    pub run: String,
    pub extend: Option<String>,
}
