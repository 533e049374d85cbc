use super::{connection::Connection, Supervisor};
use crate::ws::{
    client::{error, Control, GatewayError},
    event::StateChange,
    options::GatewayUrl,
    retry::{DisconnectAction, DisconnectCause},
    session::ConnectionState,
    transport::CloseStatus,
};

/// What to do after the backoff wait
enum AfterWait {
    Connect,
    Stop { resumable: bool },
}

impl Supervisor {
    fn connect_url(&self, resume: bool) -> url::Url {
        if resume {
            if let Some(resume_url) = self.session.resume_url() {
                match resume_url.parse::<GatewayUrl>() {
                    Ok(gateway) => return gateway.url(self.options.compress),
                    Err(err) => log::warn!(
                        "Invalid resume url {}, use gateway url instead: {}",
                        resume_url,
                        err
                    ),
                }
            }
        }

        self.gateway.url(self.options.compress)
    }

    /// Open one connection and run it until it ends
    async fn connect_once(&mut self) -> (DisconnectCause, DisconnectAction) {
        let resume = self.state() == ConnectionState::StartResuming;
        let url = self.connect_url(resume);

        log::info!("Connecting to {} in {} state", url, self.state());

        let transport = match self.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(err) => {
                log::warn!("Connect to gateway failed: {}", err);
                let cause = DisconnectCause::Failure(err.to_string());
                let action = cause.classify(self.session.resumable());
                return (cause, action);
            }
        };

        let mut connection = match Connection::new(self, transport) {
            Ok(connection) => connection,
            Err(err) => {
                let cause = DisconnectCause::Failure(err.to_string());
                let action = cause.classify(self.session.resumable());
                return (cause, action);
            }
        };

        let cause = connection.run().await;
        let action = cause.classify(connection.session_resumable());
        connection.close(&cause, action).await;

        (cause, action)
    }

    async fn wait_backoff(&mut self, backoff: std::time::Duration) -> AfterWait {
        if backoff.is_zero() {
            return AfterWait::Connect;
        }

        log::debug!("Wait {:?} before reconnecting", backoff);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => AfterWait::Connect,
            control = self.recv_control() => match control {
                Control::Close { resumable } => AfterWait::Stop { resumable },
                Control::Reconnect => {
                    log::debug!("Reconnect requested, skip backoff");
                    AfterWait::Connect
                }
            },
        }
    }

    async fn stop(&mut self, resumable: bool, status: CloseStatus) -> CloseStatus {
        let resumable = resumable && self.session.resumable();

        self.retry.clear();
        self.move_to(ConnectionState::Disconnected);

        if resumable {
            log::info!("Gateway client stopped, session kept for resuming");
            self.events
                .state_change(StateChange::DisconnectedResume)
                .await;
        } else {
            log::info!("Gateway client stopped with status {}", status);
            self.session.invalidate();
            self.events
                .state_change(StateChange::Disconnected {
                    status: status.clone(),
                })
                .await;
        }

        self.publish_health();

        status
    }

    async fn fail(&mut self, err: GatewayError) -> GatewayError {
        log::error!("Gateway client stopped: {}", err);

        self.move_to(ConnectionState::Disconnected);
        self.publish_health();
        self.events.error(err.clone()).await;

        err
    }

    /// Keep connecting until stopped by the user, a fatal close or exhausted retries
    pub async fn run(mut self) -> Result<CloseStatus, GatewayError> {
        log::info!(
            "Gateway client start, shard {}",
            self.options.identify.shard
        );

        loop {
            self.move_to(self.session.start_state());

            let (cause, action) = self.connect_once().await;

            log::info!("Disconnected: {}, next: {:?}", cause, action);

            match action {
                DisconnectAction::Fatal => {
                    let status = cause.status(action);
                    self.session.invalidate();
                    self.retry.clear();
                    self.move_to(ConnectionState::Disconnected);
                    self.events
                        .state_change(StateChange::Disconnected {
                            status: status.clone(),
                        })
                        .await;

                    let err = if status.code == 4004 {
                        error::AuthenticationFailed { status }.build()
                    } else {
                        error::Fatal { status }.build()
                    };
                    return Err(self.fail(err).await);
                }
                DisconnectAction::Stop { resumable } => {
                    let status = cause.status(action);
                    return Ok(self.stop(resumable, status).await);
                }
                DisconnectAction::Resume | DisconnectAction::Reidentify => {}
            }

            let resume = action == DisconnectAction::Resume;
            if !resume {
                self.session.invalidate();
                self.publish_health();
            }

            let plan = match self.retry.next(&self.options.reconnect, resume) {
                Some(plan) => plan,
                None => {
                    let err = error::RetriesExhausted {
                        attempts: self.retry.attempts(),
                        cause,
                    }
                    .build();
                    return Err(self.fail(err).await);
                }
            };

            self.move_to(action.next_state());

            let change = match (plan.attempt, resume) {
                (1, true) => StateChange::RetryStartedResume {
                    backoff: plan.backoff,
                },
                (1, false) => StateChange::RetryStarted {
                    backoff: plan.backoff,
                },
                (attempt, _) => StateChange::RetryFailed {
                    attempt: attempt - 1,
                    backoff: plan.backoff,
                },
            };
            self.events.state_change(change).await;

            if !resume {
                self.events
                    .state_change(StateChange::SessionInvalidated)
                    .await;
            }

            log::info!(
                "Reconnect attempt {} in {:?}, resume: {}",
                plan.attempt,
                plan.backoff,
                plan.resume
            );

            if let AfterWait::Stop { resumable } = self.wait_backoff(plan.backoff).await {
                let cause = DisconnectCause::UserClose { resumable };
                let action = cause.classify(self.session.resumable());
                let status = cause.status(action);
                return Ok(self.stop(resumable, status).await);
            }
        }
    }
}
