//! Interactive operator menu of a manager process.

use std::io::{self, Write};

use color_print::{cprint, cprintln};

use ivydsm::{pf_info, CmRole, DsmError, ManagerNode};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable menu choices.
#[derive(Debug, PartialEq, Eq)]
enum MenuChoice {
    /// Print page records.
    ShowRecords,

    /// Print pending write queues.
    ShowQueues,

    /// Terminate the manager.
    Kill,

    /// Simulate an outage for the configured time.
    Reboot,

    /// Tell all registered clients to run their workload.
    StartWorkloads,

    /// Nothing read.
    Nothing,
}

impl MenuChoice {
    fn parse(line: &str) -> Result<Self, DsmError> {
        match line.trim() {
            "" => Ok(MenuChoice::Nothing),
            "1" => Ok(MenuChoice::ShowRecords),
            "2" => Ok(MenuChoice::ShowQueues),
            "3" => Ok(MenuChoice::Kill),
            "4" => Ok(MenuChoice::Reboot),
            "5" => Ok(MenuChoice::StartWorkloads),
            other => Err(DsmError::msg(format!("unrecognized choice: {}", other))),
        }
    }
}

/// Operator console wrapping a running manager.
pub struct ManagerConsole {
    manager: ManagerNode,
    role: CmRole,
}

impl ManagerConsole {
    pub fn new(manager: ManagerNode, role: CmRole) -> Self {
        ManagerConsole { manager, role }
    }

    fn print_prompt() {
        cprint!("<bright-yellow>{}</>", PROMPT);
        let _ = io::stdout().flush();
    }

    fn print_menu(&self, err: Option<&DsmError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        cprintln!(
            "<bright-red>MENU ({:?} @ {}):</>",
            self.role,
            self.manager.local_addr()
        );
        println!("    1  show page records");
        println!("    2  show write queues");
        println!("    3  kill");
        println!("    4  reboot");
        println!("    5  start client workloads");
        Self::print_prompt();
    }

    async fn show_records(&self) {
        let records = self.manager.records().await;
        if records.is_empty() {
            println!("(no records)");
        }
        for (page, record) in records {
            let mut copies: Vec<String> =
                record.copies.iter().map(|c| c.to_string()).collect();
            copies.sort();
            println!(
                "page {:>4}  owner {}  copies [{}]",
                page,
                record.owner,
                copies.join(", ")
            );
        }
    }

    async fn show_queues(&self) {
        let queues = self.manager.write_queues().await;
        if queues.is_empty() {
            println!("(no pending writes)");
        }
        for (page, queue) in queues {
            let writers: Vec<String> =
                queue.iter().map(|w| w.to_string()).collect();
            println!("page {:>4}  [{}]", page, writers.join(" <- "));
        }
    }

    /// Serves menu choices read from stdin until Kill is chosen or the
    /// process is told to terminate.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DsmError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        self.print_menu(None);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        // no console attached; run until terminated
                        let _ = rx_term.changed().await;
                        break;
                    };

                    match MenuChoice::parse(&line) {
                        Ok(MenuChoice::Nothing) => Self::print_prompt(),
                        Ok(MenuChoice::ShowRecords) => {
                            self.show_records().await;
                            Self::print_prompt();
                        }
                        Ok(MenuChoice::ShowQueues) => {
                            self.show_queues().await;
                            Self::print_prompt();
                        }
                        Ok(MenuChoice::Kill) => break,
                        Ok(MenuChoice::Reboot) => {
                            self.manager.reboot_default().await;
                            self.print_menu(None);
                        }
                        Ok(MenuChoice::StartWorkloads) => {
                            let started = self.manager.start_workloads().await;
                            println!("started {} clients", started);
                            Self::print_prompt();
                        }
                        Err(e) => self.print_menu(Some(&e)),
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_info!(self.manager.name(); "manager shutting down");
        self.manager.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod console_tests {
    use super::*;

    #[test]
    fn parse_choices() {
        assert_eq!(MenuChoice::parse(" 1 "), Ok(MenuChoice::ShowRecords));
        assert_eq!(MenuChoice::parse("2"), Ok(MenuChoice::ShowQueues));
        assert_eq!(MenuChoice::parse("3\n"), Ok(MenuChoice::Kill));
        assert_eq!(MenuChoice::parse("4"), Ok(MenuChoice::Reboot));
        assert_eq!(MenuChoice::parse("5"), Ok(MenuChoice::StartWorkloads));
        assert_eq!(MenuChoice::parse(""), Ok(MenuChoice::Nothing));
        assert!(MenuChoice::parse("6").is_err());
        assert!(MenuChoice::parse("records").is_err());
    }
}
