pub struct DefaultsConfig {
    pub temperature: f64,
    pub gr_threshold: f64,
    pub gr_chains: usize,
    pub num_nodes: usize,
    pub seed_method: &'static str,
    pub fit_method: &'static str,
    pub max_extensions: u32,
    pub extension_length: f64,
    pub sampling_length: f64,
    pub kmeans_iterations: usize,
    pub auto_refines: u32,
    pub not_converged: &'static str,
    pub refine_num_nodes: usize,
    pub reweight_method: &'static str,
    pub energy_column: &'static str,
    pub lag: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub lock_guard_seconds: f64,
    pub shell: &'static str,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            temperature: 300.0,
            gr_threshold: 1.1,
            gr_chains: 5,
            num_nodes: 10,
            seed_method: "kmeans",
            fit_method: "switch",
            max_extensions: 5,
            extension_length: 100.0,
            sampling_length: 100.0,
            kmeans_iterations: 100,
            auto_refines: 0,
            not_converged: "refine",
            refine_num_nodes: 2,
            reweight_method: "direct",
            energy_column: "energy",
            lag: 1,
            tolerance: 1e-2,
            max_iterations: 1000,
            lock_guard_seconds: 1.0,
            shell: "sh",
        }
    }
}
