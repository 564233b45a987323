//! Inspection commands - Query a running global component manager

use colored::*;
use mtask_core::communication::network::{TcpTransport, Transport};
use mtask_core::error::MtaskResult;
use mtask_core::manager::GlobalClient;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn connect(global: &str, timeout: Duration) -> MtaskResult<GlobalClient> {
    let transport: Arc<dyn Transport> = TcpTransport::new(timeout)?;
    Ok(GlobalClient::new(transport, global, timeout))
}

/// Round trip to the global manager
pub fn ping(client: &GlobalClient) -> MtaskResult<()> {
    let started = Instant::now();
    let name = client.ping()?;
    println!(
        "{} {} answered as '{}' in {:.2?}",
        "[OK]".green().bold(),
        client.address(),
        name,
        started.elapsed()
    );
    Ok(())
}

pub fn list_processes(client: &GlobalClient) -> MtaskResult<()> {
    let processes = client.processes()?;
    if processes.is_empty() {
        println!("{}", "No processes registered.".yellow());
        return Ok(());
    }

    println!("{}", "Registered Processes:".green().bold());
    println!();
    println!("  {:<24} {}", "NAME".dimmed(), "ADDRESS".dimmed());
    for process in &processes {
        println!("  {:<24} {}", process.name.white().bold(), process.address);
    }
    println!();
    println!("  {} {} process(es)", "Total:".dimmed(), processes.len());
    Ok(())
}

pub fn list_components(client: &GlobalClient, process: Option<&str>, verbose: bool) -> MtaskResult<()> {
    let components = client.components(process)?;
    if components.is_empty() {
        println!("{}", "No components registered.".yellow());
        return Ok(());
    }

    println!("{}", "Registered Components:".green().bold());
    println!();
    for (process, component) in &components {
        println!(
            "  {} {}:{} ({})",
            "Component:".cyan(),
            process.dimmed(),
            component.name.white().bold(),
            component.kind
        );
        for interface in &component.provided {
            println!("    {} {}", "Provides:".dimmed(), interface.name);
            if verbose {
                for command in &interface.commands {
                    let argument = command
                        .argument
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let result = command
                        .result
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "      {} {:?} {} ({} -> {})",
                        "command".dimmed(),
                        command.role,
                        command.name,
                        argument,
                        result
                    );
                }
                for event in &interface.events {
                    println!("      {} {}", "event".dimmed(), event.name);
                }
            }
        }
        for interface in &component.required {
            println!("    {} {}", "Requires:".dimmed(), interface.name);
            if verbose {
                for function in &interface.functions {
                    println!("      {} {}", "function".dimmed(), function.name);
                }
                for handler in &interface.event_handlers {
                    println!("      {} {}", "handler".dimmed(), handler);
                }
            }
        }
    }
    Ok(())
}

pub fn list_connections(client: &GlobalClient) -> MtaskResult<()> {
    let connections = client.connections()?;
    if connections.is_empty() {
        println!("{}", "No connections brokered.".yellow());
        return Ok(());
    }

    println!("{}", "Connections:".green().bold());
    println!();
    for connection in &connections {
        println!(
            "  {} {} {} {}",
            format!("#{}", connection.id).dimmed(),
            connection.required.to_string().white(),
            "->".cyan(),
            connection.provided.to_string().white().bold()
        );
    }
    Ok(())
}
