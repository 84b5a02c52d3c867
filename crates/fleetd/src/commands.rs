//! One-shot subcommands that work directly on the store.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use fleetgrid_placement::{JobPlan, RunSpec};
use fleetgrid_state::{Fleet, FleetSpec, Offer, Project, StateStore};

/// A fleet as declared in a TOML file: a name plus its spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetFile {
    pub name: String,
    #[serde(flatten)]
    pub spec: FleetSpec,
}

impl FleetFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

pub fn load_run_spec(path: &Path) -> anyhow::Result<RunSpec> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Create the fleet, or replace the spec of the project's fleet with the
/// same name. The project row is created on first use.
pub fn apply_fleet(
    store: &StateStore,
    project: &str,
    file: FleetFile,
    now: u64,
) -> anyhow::Result<Fleet> {
    if let Err(reason) = file.spec.validate() {
        bail!("fleet {}: {reason}", file.name);
    }
    match store.get::<Project>(project)? {
        Some(p) if p.deleted => bail!("project {project} is deleted"),
        Some(_) => {}
        None => store.put(&Project {
            name: project.to_string(),
            deleted: false,
            created_at: now,
        })?,
    }

    let existing = store
        .list_project_fleets(project)?
        .into_iter()
        .find(|f| f.name == file.name);
    let fleet = match existing {
        Some(mut fleet) => {
            fleet.spec = file.spec;
            fleet.consolidation_attempt = 0;
            fleet.last_consolidated_at = None;
            info!(fleet = %fleet.id, name = %fleet.name, "fleet updated");
            fleet
        }
        None => {
            let fleet = Fleet::new(&Uuid::new_v4().to_string(), &file.name, project, file.spec, now);
            info!(fleet = %fleet.id, name = %fleet.name, "fleet created");
            fleet
        }
    };
    store.put(&fleet)?;
    Ok(fleet)
}

/// Human-readable job plans, one offer table per job.
pub fn render_plans(run: &RunSpec, plans: &[JobPlan]) -> String {
    let mut out = String::new();
    for plan in plans {
        let fleet = plan.fleet.as_deref().unwrap_or("<new fleet>");
        let _ = writeln!(
            out,
            "{} job {}  fleet: {}  offers: {} of {}",
            run.run_name,
            plan.job_num,
            fleet,
            plan.offers.len(),
            plan.total_offers
        );
        if plan.offers.is_empty() {
            let _ = writeln!(out, "  no offers");
            continue;
        }
        let _ = writeln!(
            out,
            "  {:<3} {:<10} {:<12} {:<14} {:<24} {:>9}  {}",
            "#", "BACKEND", "REGION", "INSTANCE", "RESOURCES", "PRICE", "AVAILABILITY"
        );
        for (i, offer) in plan.offers.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {:<3} {:<10} {:<12} {:<14} {:<24} {:>9}  {}",
                i + 1,
                offer.backend,
                offer.region,
                offer.instance.name,
                describe(offer),
                format!("${:.4}", offer.price),
                availability(offer)
            );
        }
    }
    out
}

fn describe(offer: &Offer) -> String {
    let r = &offer.instance.resources;
    let mut text = format!("{}xCPU {}GB", r.cpus, r.memory_mib / 1024);
    if let Some(gpu) = r.gpus.first() {
        let _ = write!(text, " {}x{}", r.gpus.len(), gpu.name);
    }
    if r.spot {
        text.push_str(" spot");
    }
    text
}

fn availability(offer: &Offer) -> String {
    let label = serde_json::to_value(offer.availability)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    match &offer.instance_id {
        Some(id) if offer.total_blocks > 1 => {
            format!("{label} ({id}, {}/{} blocks)", offer.blocks, offer.total_blocks)
        }
        Some(id) => format!("{label} ({id})"),
        None => label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{Availability, Blocks, FleetNodes, InstanceType, Resources};

    fn fleet_file(name: &str, min: u32) -> FleetFile {
        FleetFile {
            name: name.to_string(),
            spec: FleetSpec {
                nodes: Some(FleetNodes { min, max: Some(4) }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn fleet_file_parses_flattened_spec() {
        let file: FleetFile = toml::from_str(
            r#"
name = "gpu"
placement = "cluster"
blocks = { fixed = 2 }
backends = ["lab"]

[nodes]
min = 1
max = 3
"#,
        )
        .unwrap();
        assert_eq!(file.name, "gpu");
        assert_eq!(file.spec.min_nodes(), 1);
        assert_eq!(file.spec.max_nodes(), Some(3));
        assert_eq!(file.spec.blocks, Blocks::Fixed(2));
        assert_eq!(file.spec.backends, Some(vec!["lab".to_string()]));
    }

    #[test]
    fn apply_creates_then_updates() {
        let store = StateStore::open_in_memory().unwrap();
        let created = apply_fleet(&store, "main", fleet_file("gpu", 1), 10).unwrap();
        assert!(store.get::<Project>("main").unwrap().is_some());

        let updated = apply_fleet(&store, "main", fleet_file("gpu", 2), 20).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.spec.min_nodes(), 2);
        assert_eq!(store.list_project_fleets("main").unwrap().len(), 1);
    }

    #[test]
    fn apply_rejects_invalid_spec() {
        let store = StateStore::open_in_memory().unwrap();
        let mut file = fleet_file("gpu", 5);
        file.spec.nodes = Some(FleetNodes { min: 5, max: Some(1) });
        let err = apply_fleet(&store, "main", file, 10).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        assert!(store.list::<Fleet>().unwrap().is_empty());
    }

    #[test]
    fn apply_refuses_deleted_project() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&Project {
                name: "gone".to_string(),
                deleted: true,
                created_at: 0,
            })
            .unwrap();
        assert!(apply_fleet(&store, "gone", fleet_file("gpu", 0), 10).is_err());
    }

    #[test]
    fn render_marks_empty_plans() {
        let run: RunSpec = toml::from_str("run_name = \"train\"").unwrap();
        let offer = Offer {
            backend: "lab".to_string(),
            region: "us".to_string(),
            availability_zones: None,
            instance: InstanceType {
                name: "gpu-8x".to_string(),
                resources: Resources {
                    cpus: 64,
                    memory_mib: 512 * 1024,
                    gpus: vec![
                        fleetgrid_state::Gpu {
                            name: "H100".to_string(),
                            memory_mib: 80 * 1024,
                        };
                        2
                    ],
                    disk_mib: 0,
                    spot: false,
                },
            },
            price: 6.5,
            availability: Availability::Idle,
            blocks: 2,
            total_blocks: 8,
            instance_id: Some("i-1".to_string()),
        };
        let plans = [
            JobPlan {
                job_num: 0,
                fleet: Some("gpu".to_string()),
                offers: vec![offer],
                total_offers: 1,
                max_price: Some(6.5),
            },
            JobPlan {
                job_num: 1,
                fleet: None,
                offers: Vec::new(),
                total_offers: 0,
                max_price: None,
            },
        ];
        let text = render_plans(&run, &plans);
        assert!(text.contains("train job 0  fleet: gpu  offers: 1 of 1"));
        assert!(text.contains("2xH100"));
        assert!(text.contains("idle (i-1, 2/8 blocks)"));
        assert!(text.contains("$6.5000"));
        assert!(text.contains("fleet: <new fleet>"));
        assert!(text.contains("no offers"));
    }
}
