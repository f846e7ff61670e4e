/// CLI for relay backend operators
use relay_core::optimizer::{optimize_matrix, OptimizeOptions};
use relay_core::route_matrix::RouteMatrixAnalysis;
use relay_core::stats::RelayInfo;
use relay_core::{CostMatrix, RouteMatrix};
use std::io::{BufRead, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 40000;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "relays" => {
            list_relays()?;
        }
        "analysis" => {
            show_analysis()?;
        }
        "report" => {
            relay_report(args.get(2).map(Path::new))?;
        }
        "optimize" => {
            if args.len() < 3 {
                eprintln!("Usage: cli optimize <costs.json> [route_matrix.bin]");
                return Ok(());
            }
            optimize_file(Path::new(&args[2]), args.get(3).map(Path::new))?;
        }
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: cli inspect <route_matrix.bin>");
                return Ok(());
            }
            inspect_file(Path::new(&args[2]))?;
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Relay backend CLI");
    println!();
    println!("Usage: cli <command> [args]");
    println!();
    println!("Commands:");
    println!("  relays                              List relays and their status");
    println!("  analysis                            Analyze the published route matrix");
    println!("  report [out.csv]                    Relay status report as CSV");
    println!("  optimize <costs.json> [out.bin]     Optimize a cost matrix offline");
    println!("  inspect <route_matrix.bin>          Analyze an encoded route matrix");
    println!();
    println!("The backend API port is read from RELAY_CORE_API_PORT (default {}).", DEFAULT_API_PORT);
}

fn get_api_port() -> u16 {
    std::env::var("RELAY_CORE_API_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_API_PORT)
}

/// Send one request and return the response's `data`, exiting on an API error
fn request(command: &str) -> anyhow::Result<serde_json::Value> {
    let addr = SocketAddr::from(([127, 0, 0, 1], get_api_port()));
    let mut stream = TcpStream::connect(addr).map_err(|e| {
        anyhow::anyhow!("Could not reach relay backend on {}: {}", addr, e)
    })?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let request = serde_json::json!({ "command": command });
    writeln!(stream, "{}", request)?;

    let mut response = String::new();
    std::io::BufReader::new(&stream).read_line(&mut response)?;

    let resp: serde_json::Value = serde_json::from_str(&response)?;

    if resp["success"].as_bool().unwrap_or(false) {
        Ok(resp["data"].clone())
    } else {
        let error = resp["error"].as_str().unwrap_or("Unknown error");
        eprintln!("✗ Error: {}", error);
        std::process::exit(1);
    }
}

fn list_relays() -> anyhow::Result<()> {
    let data = request("relays")?;
    let relays = data["relays"].as_array().cloned().unwrap_or_default();

    if relays.is_empty() {
        println!("No relays found");
        return Ok(());
    }

    println!("Relays ({}):", relays.len());
    println!("{:-<72}", "");
    for relay in &relays {
        let name = relay["name"].as_str().unwrap_or("?");
        let addr = relay["address"].as_str().unwrap_or("-");
        let status = relay["status"].as_str().unwrap_or("?");
        let sessions = relay["sessions"].as_u64().unwrap_or(0);
        println!("  {:<24} {:<22} {:<14} {} sessions", name, addr, status, sessions);
    }

    Ok(())
}

fn show_analysis() -> anyhow::Result<()> {
    let data = request("analysis")?;
    let analysis: RouteMatrixAnalysis = serde_json::from_value(data["analysis"].clone())?;
    println!(
        "Route matrix created at {}",
        data["created_at"].as_u64().unwrap_or(0)
    );
    print_analysis(&analysis);
    Ok(())
}

fn relay_report(output: Option<&Path>) -> anyhow::Result<()> {
    let data = request("relays_csv")?;
    let csv = data["csv"].as_str().unwrap_or_default();

    match output {
        Some(path) => {
            std::fs::write(path, csv)?;
            println!("✓ Wrote relay report to {}", path.display());
        }
        None => print!("{}", csv),
    }

    Ok(())
}

fn optimize_file(costs_path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(costs_path)?;
    let costs: CostMatrix = serde_json::from_str(&content)?;
    costs.validate()?;

    let relays: Vec<RelayInfo> = costs
        .relay_ids
        .iter()
        .map(|id| RelayInfo {
            id: *id,
            name: format!("{:016x}", id),
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
            datacenter_id: 0,
            latitude: 0.0,
            longitude: 0.0,
            dest: true,
        })
        .collect();

    let start = std::time::Instant::now();
    let entries = optimize_matrix(&costs, relays.len(), &OptimizeOptions::default());
    println!(
        "Optimized {} relays in {:?}",
        relays.len(),
        start.elapsed()
    );

    let created_at = chrono::Utc::now().timestamp().max(0) as u64;
    let matrix = RouteMatrix::new(&relays, entries, created_at);
    print_analysis(&matrix.analyze());

    if let Some(path) = output {
        matrix.write_file(path)?;
        println!("✓ Wrote route matrix to {}", path.display());
    }

    Ok(())
}

fn inspect_file(path: &Path) -> anyhow::Result<()> {
    let matrix = RouteMatrix::read_file(path)?;
    println!("Route matrix {}", path.display());
    println!("{:-<60}", "");
    println!("  Version:    {}", matrix.version);
    println!("  Created at: {}", matrix.created_at);
    println!("  Relays:     {}", matrix.num_relays());
    print_analysis(&matrix.analyze());
    Ok(())
}

fn print_analysis(analysis: &RouteMatrixAnalysis) {
    println!("{:-<60}", "");
    println!("  Relay pairs:          {}", analysis.relay_pairs);
    println!("  Dest relays:          {}", analysis.dest_relays);
    println!("  Total routes:         {}", analysis.total_routes);
    println!("  Average routes/pair:  {:.2}", analysis.average_num_routes);
    println!("  Average route length: {:.2}", analysis.average_route_length);
    println!("  Max routes/pair:      {}", analysis.max_routes_per_pair);
    println!("  Max route length:     {}", analysis.max_route_length);
    println!("  No route:             {:.1}%", analysis.no_route_percent);
    println!("  One route:            {:.1}%", analysis.one_route_percent);
    println!("  No direct route:      {:.1}%", analysis.no_direct_route_percent);
    println!("  No improvement:       {:.1}%", analysis.no_improvement_percent);
    println!("  Improvement over direct:");
    for (bucket, percent) in analysis.improvement_buckets.iter().enumerate() {
        let label = if bucket + 1 == analysis.improvement_buckets.len() {
            format!("{}+ms", bucket * 5 + 1)
        } else {
            format!("{}-{}ms", bucket * 5 + 1, bucket * 5 + 5)
        };
        println!("    {:<10} {:.1}%", label, percent);
    }
}
