//! [`ApiObject`] implementations for the two persisted kinds.

use fleetd_types::{
    MissionObject, MissionQueryParams, MissionSpec, MissionStatus, ObjectLifecycle, RobotObject,
    RobotQueryParams, RobotSpec, RobotStatus,
};

use crate::ApiObject;

impl ApiObject for RobotObject {
    type Spec = RobotSpec;
    type Status = RobotStatus;
    type Query = RobotQueryParams;

    fn alias() -> &'static str {
        "robot"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> ObjectLifecycle {
        self.lifecycle
    }

    fn set_lifecycle(&mut self, lifecycle: ObjectLifecycle) {
        self.lifecycle = lifecycle;
    }

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn set_spec(&mut self, spec: Self::Spec) {
        self.spec = spec;
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }

    fn set_status(&mut self, status: Self::Status) {
        self.status = status;
    }

    fn apply_query(items: Vec<Self>, query: &Self::Query) -> Vec<Self> {
        items
            .into_iter()
            .filter(|robot| {
                query
                    .min_battery
                    .map_or(true, |min| robot.status.battery_level >= min)
                    && query
                        .max_battery
                        .map_or(true, |max| robot.status.battery_level <= max)
                    && query.state.map_or(true, |state| robot.status.state == state)
                    && query.online.map_or(true, |online| robot.status.online == online)
                    && query
                        .names
                        .as_ref()
                        .map_or(true, |names| names.iter().any(|n| n == &robot.name))
            })
            .collect()
    }
}

impl ApiObject for MissionObject {
    type Spec = MissionSpec;
    type Status = MissionStatus;
    type Query = MissionQueryParams;

    fn alias() -> &'static str {
        "mission"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> ObjectLifecycle {
        self.lifecycle
    }

    fn set_lifecycle(&mut self, lifecycle: ObjectLifecycle) {
        self.lifecycle = lifecycle;
    }

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn set_spec(&mut self, spec: Self::Spec) {
        self.spec = spec;
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }

    fn set_status(&mut self, status: Self::Status) {
        self.status = status;
    }

    fn apply_query(items: Vec<Self>, query: &Self::Query) -> Vec<Self> {
        let mut missions: Vec<Self> = items
            .into_iter()
            .filter(|mission| {
                query
                    .state
                    .map_or(true, |state| mission.status.state == state)
                    && query
                        .robot
                        .as_ref()
                        .map_or(true, |robot| &mission.spec.robot == robot)
                    && query.started_after.map_or(true, |after| {
                        mission.status.start_timestamp.is_some_and(|t| t >= after)
                    })
                    && query.started_before.map_or(true, |before| {
                        mission.status.start_timestamp.is_some_and(|t| t <= before)
                    })
            })
            .collect();
        if let Some(most_recent) = query.most_recent {
            missions.sort_by(|a, b| b.status.start_timestamp.cmp(&a.status.start_timestamp));
            missions.truncate(most_recent);
        }
        missions
    }
}
