use host_exec::ExecOptions;
use tracing::Level;

use crate::controller::HostController;

impl HostController {
    /// Install a firewall rule dropping outbound TCP traffic to the given
    /// address and port, simulating a network partition. The rule stays in
    /// place until [`HostController::network_reset`] or cleanup runs.
    pub async fn network_drop(&mut self, ipaddr: &str, port: u16) -> anyhow::Result<()> {
        self.need_network_reset = true;
        let cmd = format!(
            "{} -A OUTPUT -p tcp -d {} --dport {} -j DROP",
            self.config.iptables, ipaddr, port
        );
        let opts = ExecOptions::elevated()
            .at(Level::TRACE)
            .with_msg("Network drop: ");
        self.run_cmd(&cmd, &opts).await?;
        Ok(())
    }

    /// Flush all firewall rules and chains installed by this run. Best
    /// effort; failures are logged and the reset flag is cleared either
    /// way.
    pub async fn network_reset(&mut self) {
        let flush = format!("{} --flush", self.config.iptables);
        let opts = ExecOptions::elevated()
            .at(Level::TRACE)
            .with_msg("Network reset: ");
        if let Err(err) = self.run_cmd(&flush, &opts).await {
            tracing::warn!(error = %err, "failed to flush firewall rules");
        }
        let delete = format!("{} --delete-chain", self.config.iptables);
        if let Err(err) = self.run_cmd(&delete, &opts).await {
            tracing::warn!(error = %err, "failed to delete firewall chains");
        }
        self.need_network_reset = false;
    }
}
