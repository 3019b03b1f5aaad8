use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use pkg_cluster::{Cluster, IngressEvent};
use pkg_types::ingress::Ingress;

/// What the ingress controller drives. Implemented by the router facade.
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn target_add(&self, host: &str, target: &str) -> anyhow::Result<()>;
    async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()>;
    fn set_idles_allowed(&self, host: &str, allowed: bool);
    /// Address published as the load-balancer ingress on reconciled objects.
    fn ingress_ip(&self) -> String;
}

/// Reconciles `system=convox` ingress objects into routes.
///
/// Routes are reference-counted across objects: a (host, target) pair is
/// removed only when no remaining object asks for it.
pub struct IngressController {
    routes: Arc<dyn RouteTable>,
    cluster: Arc<dyn Cluster>,
    known: Mutex<HashMap<String, Reconciled>>,
}

/// An object whose routes are in the table.
#[derive(Clone)]
struct Reconciled {
    ingress: Ingress,
    /// Status carries the router address for this revision.
    published: bool,
}

impl IngressController {
    pub fn new(routes: Arc<dyn RouteTable>, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            routes,
            cluster,
            known: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, event: IngressEvent) -> anyhow::Result<()> {
        match event {
            IngressEvent::Applied(ing) => self.apply(ing).await,
            IngressEvent::Deleted(ing) => self.delete(ing).await,
            IngressEvent::Restarted(list) => self.resync(list).await,
        }
    }

    /// Consume watch events until the channel closes. Events are reconciled
    /// only while `leader` reads true; on gaining leadership the latest
    /// observed set is reconciled in full.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<IngressEvent>,
        mut leader: watch::Receiver<bool>,
    ) {
        info!("IngressController started");
        let mut observed: BTreeMap<String, Ingress> = BTreeMap::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    track(&mut observed, &event);
                    if !*leader.borrow() {
                        continue;
                    }
                    if let Err(e) = self.handle(event).await {
                        warn!(stage = "reconcile", error = %e, "Ingress reconcile failed");
                    }
                }
                changed = leader.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *leader.borrow_and_update() {
                        info!(objects = observed.len(), "Leader: reconciling observed ingresses");
                        let current = observed.values().cloned().collect();
                        if let Err(e) = self.resync(current).await {
                            warn!(stage = "resync", error = %e, "Ingress resync failed");
                        }
                    } else {
                        info!("Not leader: ingress reconciliation paused");
                    }
                }
            }
        }
        info!("IngressController stopped");
    }

    async fn apply(&self, ing: Ingress) -> anyhow::Result<()> {
        let key = ing.key();
        let mut known = self.known.lock().await;

        let previous = known.get(&key).cloned();
        let unchanged = previous
            .as_ref()
            .is_some_and(|old| old.ingress.same_desired_state(&ing));
        if unchanged && previous.as_ref().is_some_and(|old| old.published) {
            debug!(ingress = %key, "Ingress unchanged");
            return Ok(());
        }

        if !unchanged {
            let desired = ing.routes();
            for (host, target) in &desired {
                self.routes.target_add(host, target).await?;
            }
            for host in ing.hosts() {
                self.routes.set_idles_allowed(&host, ing.idles_allowed());
            }

            if let Some(previous) = &previous {
                let others = routes_excluding(&known, &key);
                for (host, target) in previous.ingress.routes() {
                    let pair = (host, target);
                    if desired.contains(&pair) || others.contains(&pair) {
                        continue;
                    }
                    self.routes.target_remove(&pair.0, &pair.1).await?;
                }
            }

            // The route table now holds this object's routes; only the
            // status publish below is left to retry.
            info!(
                ingress = %key,
                namespace = %ing.namespace,
                routes = desired.len(),
                idles = ing.idles_allowed(),
                "Ingress routes reconciled"
            );
            known.insert(
                key.clone(),
                Reconciled {
                    ingress: ing.clone(),
                    published: false,
                },
            );
        }

        let ip = self.routes.ingress_ip();
        self.cluster
            .update_ingress_status(&ing.namespace, &ing.name, &ip)
            .await?;
        if let Some(entry) = known.get_mut(&key) {
            entry.published = true;
        }
        debug!(ingress = %key, ip = %ip, "Ingress status published");
        Ok(())
    }

    async fn delete(&self, ing: Ingress) -> anyhow::Result<()> {
        let key = ing.key();
        let mut known = self.known.lock().await;

        // The reconciled copy is what the route table holds; the event copy
        // covers edits that failed part-way.
        let mut removed: BTreeSet<(String, String)> = ing.routes().into_iter().collect();
        if let Some(entry) = known.get(&key) {
            removed.extend(entry.ingress.routes());
        }
        let others = routes_excluding(&known, &key);
        for (host, target) in removed {
            if others.contains(&(host.clone(), target.clone())) {
                continue;
            }
            self.routes.target_remove(&host, &target).await?;
        }

        known.remove(&key);
        info!(ingress = %key, "Ingress removed");
        Ok(())
    }

    /// Reconcile against a full listing: objects missing from it are deleted.
    async fn resync(&self, current: Vec<Ingress>) -> anyhow::Result<()> {
        let present: BTreeSet<String> = current.iter().map(Ingress::key).collect();
        let gone: Vec<Ingress> = {
            let known = self.known.lock().await;
            known
                .values()
                .filter(|entry| !present.contains(&entry.ingress.key()))
                .map(|entry| entry.ingress.clone())
                .collect()
        };

        let mut first_err = None;
        for ing in gone {
            if let Err(e) = self.delete(ing).await {
                first_err.get_or_insert(e);
            }
        }
        for ing in current {
            let key = ing.key();
            if let Err(e) = self.apply(ing).await {
                warn!(ingress = %key, error = %e, "Ingress reconcile failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn routes_excluding(known: &HashMap<String, Reconciled>, key: &str) -> BTreeSet<(String, String)> {
    known
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .flat_map(|(_, entry)| entry.ingress.routes())
        .collect()
}

fn track(observed: &mut BTreeMap<String, Ingress>, event: &IngressEvent) {
    match event {
        IngressEvent::Applied(ing) => {
            observed.insert(ing.key(), ing.clone());
        }
        IngressEvent::Deleted(ing) => {
            observed.remove(&ing.key());
        }
        IngressEvent::Restarted(list) => {
            *observed = list.iter().map(|i| (i.key(), i.clone())).collect();
        }
    }
}
