use super::{colorize_unit_state, host_provider, EXIT_SUCCESS};
use labforge_config::LabConfig;
use labforge_remote::{UnitProvider, UnitState};
use std::time::Duration;

pub fn run(cfg: &LabConfig, json: bool) -> Result<u8, String> {
    let mut provider = host_provider(cfg)?;

    let mut rows = Vec::new();
    for unit in &cfg.units {
        let state = match provider.state(unit.id) {
            UnitState::Running => "running",
            UnitState::Stopped => "stopped",
            UnitState::Absent => "absent",
        };
        rows.push((unit.id, unit.name.clone(), unit.address.clone(), state));
    }

    let templates = provider
        .host_runner()
        .execute(
            &format!(
                "ls -lh {}/*.tar.* 2>/dev/null || echo 'no templates'",
                cfg.host.template_dir
            ),
            Some(Duration::from_secs(30)),
            false,
        )
        .output
        .unwrap_or_default();

    if json {
        let payload = serde_json::json!({
            "units": rows
                .iter()
                .map(|(id, name, address, state)| serde_json::json!({
                    "id": id,
                    "name": name,
                    "address": address,
                    "state": state,
                }))
                .collect::<Vec<_>>(),
            "templates": templates,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).map_err(|e| e.to_string())?
        );
        return Ok(EXIT_SUCCESS);
    }

    println!("Lab status ({})", cfg.host.address);
    println!("Units:");
    for (id, name, address, state) in rows {
        println!(
            "  {id:>5}  {name:<16} {address:<16} {}",
            colorize_unit_state(state)
        );
    }
    println!("Templates:");
    for line in templates.lines() {
        println!("  {line}");
    }
    Ok(EXIT_SUCCESS)
}
