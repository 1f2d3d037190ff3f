use crate::command::{CommandFailure, CommandRunner, Invocation};
use crate::impairment::{netem_args, QdiscVerb, ShapingProfile};

/// One emulated endpoint: a Linux network namespace managed via `ip netns`
/// and the veth interface inside it that carries the shaped traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkScope {
    pub namespace: String,
    pub interface: String,
    /// Address assigned to `interface` during setup, in CIDR form.
    pub address: String,
    /// Prefix commands with `sudo`.
    pub sudo: bool,
}

impl NetworkScope {
    pub fn new(namespace: &str, interface: &str, address: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            interface: interface.to_string(),
            address: address.to_string(),
            sudo: true,
        }
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Builds the argv that runs `cmd args..` inside this namespace.
    pub fn exec_argv(&self, cmd: &str, args: &[&str]) -> Vec<String> {
        let mut argv = host_argv(self.sudo, "ip", &["netns", "exec", &self.namespace, cmd]);
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

/// Builds the argv for a command run in the host namespace.
pub fn host_argv(sudo: bool, cmd: &str, args: &[&str]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    if sudo {
        argv.push("sudo".to_string());
    }
    argv.push(cmd.to_string());
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

/// Creates the client/server namespace pair joined by a veth link and
/// installs a root netem qdisc on both ends.
///
/// Any namespace left over under the same name is removed first. The qdisc is
/// installed with `initial` so later shaping changes can use `tc qdisc change`.
pub fn setup_pair(
    runner: &dyn CommandRunner,
    client: &NetworkScope,
    server: &NetworkScope,
    initial: &ShapingProfile,
) -> Result<(), CommandFailure> {
    teardown_pair(runner, client, server);

    for scope in [client, server] {
        run_logged(runner, host_argv(scope.sudo, "ip", &["netns", "add", &scope.namespace]))?;
        run_logged(runner, scope.exec_argv("ip", &["link", "set", "lo", "up"]))?;
    }

    // Leftover host-side veth from an interrupted setup.
    let _ = runner.run(&Invocation::new(&host_argv(
        client.sudo,
        "ip",
        &["link", "del", &client.interface],
    )));

    run_logged(
        runner,
        host_argv(
            client.sudo,
            "ip",
            &[
                "link",
                "add",
                &client.interface,
                "type",
                "veth",
                "peer",
                "name",
                &server.interface,
            ],
        ),
    )?;

    for scope in [client, server] {
        run_logged(
            runner,
            host_argv(
                scope.sudo,
                "ip",
                &["link", "set", &scope.interface, "netns", &scope.namespace],
            ),
        )?;
        run_logged(
            runner,
            scope.exec_argv("ip", &["addr", "add", &scope.address, "dev", &scope.interface]),
        )?;
        run_logged(
            runner,
            scope.exec_argv("ip", &["link", "set", &scope.interface, "up"]),
        )?;

        let args = netem_args(&scope.interface, initial, QdiscVerb::Add);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_logged(runner, scope.exec_argv("tc", &args))?;
    }

    tracing::info!(
        client = %client.namespace,
        server = %server.namespace,
        "namespace pair ready"
    );
    Ok(())
}

/// Deletes both namespaces. Best effort: failures are logged and ignored,
/// deleting a namespace also removes the veth pair.
pub fn teardown_pair(runner: &dyn CommandRunner, client: &NetworkScope, server: &NetworkScope) {
    for scope in [client, server] {
        let argv = host_argv(scope.sudo, "ip", &["netns", "del", &scope.namespace]);
        if let Err(e) = runner.run(&Invocation::new(&argv)) {
            tracing::debug!(namespace = %scope.namespace, error = %e, "netns delete skipped");
        }
    }
}

fn run_logged(runner: &dyn CommandRunner, argv: Vec<String>) -> Result<String, CommandFailure> {
    let invocation = Invocation::new(&argv);
    tracing::info!(command = %invocation.command_line(), "exec");
    runner.run(&invocation)
}
