//! Ticket tools.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;

use waggle_tickets::{NewTicket, TicketFilter, TicketPriority, TicketStatus, TicketUpdate};
use waggle_tools::registry::RegistryError;
use waggle_tools::{ParamSpec, ParamType, ToolRegistry};
use waggle_types::{HubError, HubResult, TicketId};

use super::{spec, ticket_err, to_json, Services};
use crate::config::ToolSection;

pub(super) fn register(
    registry: &mut ToolRegistry,
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<(), RegistryError> {
    let svc = services.clone();
    registry.register_fn(
        spec(section, "create_ticket", "Create a ticket on the board")
            .param(ParamSpec::required("project_id", ParamType::String))
            .param(ParamSpec::required("title", ParamType::String))
            .param(ParamSpec::with_default("description", ParamType::String, json!("")))
            .param(ParamSpec::with_default("ticket_type", ParamType::String, json!("task")))
            .param(ParamSpec::with_default("priority", ParamType::String, json!("medium")))
            .param(ParamSpec::optional("assignee", ParamType::String))
            .param(ParamSpec::with_default("reporter", ParamType::String, json!("unknown")))
            .param(ParamSpec::optional("labels", ParamType::List))
            .param(ParamSpec::optional("due_date", ParamType::Int))
            .param(ParamSpec::optional("time_estimate", ParamType::Int))
            .param(ParamSpec::optional("parent_ticket", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let parent_ticket = match args.opt_str("parent_ticket") {
                    Some(raw) => Some(parse_ticket_id(raw)?),
                    None => None,
                };
                let ticket = svc
                    .tickets
                    .create_ticket(NewTicket {
                        project_id: args.string("project_id")?,
                        title: args.string("title")?,
                        description: args.string("description")?,
                        ticket_type: args.string("ticket_type")?,
                        priority: parse_priority(args.str("priority")?)?,
                        assignee: args.opt_str("assignee").map(str::to_string),
                        reporter: args.string("reporter")?,
                        labels: args.string_list("labels"),
                        due_date: args.opt_int("due_date"),
                        time_estimate: args.opt_int("time_estimate"),
                        parent_ticket,
                    })
                    .await
                    .map_err(ticket_err)?;
                to_json(&ticket)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_ticket", "Fetch one ticket")
            .param(ParamSpec::required("ticket_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                match svc.tickets.get_ticket(id).await.map_err(ticket_err)? {
                    Some(ticket) => to_json(&ticket),
                    None => Ok(serde_json::Value::Null),
                }
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "update_ticket_status", "Move a ticket through its lifecycle")
            .param(ParamSpec::required("ticket_id", ParamType::String))
            .param(ParamSpec::required("status", ParamType::String))
            .param(ParamSpec::with_default("actor", ParamType::String, json!("unknown"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                let status = parse_status(args.str("status")?)?;
                let ticket = svc
                    .tickets
                    .transition(id, status, args.str("actor")?)
                    .await
                    .map_err(ticket_err)?;
                to_json(&ticket)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "assign_ticket", "Assign a ticket to an agent")
            .param(ParamSpec::required("ticket_id", ParamType::String))
            .param(ParamSpec::required("assignee", ParamType::String))
            .param(ParamSpec::with_default("actor", ParamType::String, json!("unknown"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                let ticket = svc
                    .tickets
                    .assign(id, args.str("assignee")?, args.str("actor")?)
                    .await
                    .map_err(ticket_err)?;
                to_json(&ticket)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "update_ticket", "Edit a ticket's mutable fields")
            .param(ParamSpec::required("ticket_id", ParamType::String))
            .param(ParamSpec::optional("title", ParamType::String))
            .param(ParamSpec::optional("description", ParamType::String))
            .param(ParamSpec::optional("priority", ParamType::String))
            .param(ParamSpec::optional("assignee", ParamType::String))
            .param(ParamSpec::optional("labels", ParamType::List))
            .param(ParamSpec::optional("due_date", ParamType::Int))
            .param(ParamSpec::optional("time_estimate", ParamType::Int))
            .param(ParamSpec::with_default("actor", ParamType::String, json!("unknown"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                let priority = match args.opt_str("priority") {
                    Some(raw) => Some(parse_priority(raw)?),
                    None => None,
                };
                let update = TicketUpdate {
                    title: args.opt_str("title").map(str::to_string),
                    description: args.opt_str("description").map(str::to_string),
                    priority,
                    assignee: args.opt_str("assignee").map(str::to_string),
                    labels: args.contains("labels").then(|| args.string_list("labels")),
                    due_date: args.opt_int("due_date"),
                    time_estimate: args.opt_int("time_estimate"),
                };
                let ticket = svc
                    .tickets
                    .update_ticket(id, update, args.str("actor")?)
                    .await
                    .map_err(ticket_err)?;
                to_json(&ticket)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "add_comment", "Comment on a ticket (mirrored into memory)")
            .param(ParamSpec::required("ticket_id", ParamType::String))
            .param(ParamSpec::required("text", ParamType::String))
            .param(ParamSpec::required("author", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                let comment = svc
                    .tickets
                    .add_comment(id, args.str("text")?, args.str("author")?)
                    .await
                    .map_err(ticket_err)?;
                to_json(&comment)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_comments", "Ticket comments in creation order")
            .param(ParamSpec::required("ticket_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_ticket_id(args.str("ticket_id")?)?;
                let comments = svc.tickets.get_comments(id).await.map_err(ticket_err)?;
                to_json(&comments)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "list_tickets", "List tickets with filters")
            .param(ParamSpec::optional("project_id", ParamType::String))
            .param(ParamSpec::optional("status", ParamType::String))
            .param(ParamSpec::optional("assignee", ParamType::String))
            .param(ParamSpec::with_default("limit", ParamType::Int, json!(50)))
            .param(ParamSpec::with_default("offset", ParamType::Int, json!(0))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let status = match args.opt_str("status") {
                    Some(raw) => Some(parse_status(raw)?),
                    None => None,
                };
                let tickets = svc
                    .tickets
                    .list_tickets(TicketFilter {
                        project_id: args.opt_str("project_id").map(str::to_string),
                        status,
                        assignee: args.opt_str("assignee").map(str::to_string),
                        limit: args.int("limit")?.max(0) as usize,
                        offset: args.int("offset")?.max(0) as usize,
                    })
                    .await
                    .map_err(ticket_err)?;
                to_json(&tickets)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "ticket_metrics", "Aggregate ticket metrics for a project")
            .param(ParamSpec::required("project_id", ParamType::String))
            .param(ParamSpec::with_default("days", ParamType::Int, json!(30))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let metrics = svc
                    .tickets
                    .get_metrics(args.str("project_id")?, args.int("days")?)
                    .await
                    .map_err(ticket_err)?;
                to_json(&metrics)
            }
        },
    )?;

    Ok(())
}

fn parse_ticket_id(raw: &str) -> HubResult<TicketId> {
    TicketId::parse(raw).map_err(|_| HubError::BadArgument(format!("invalid ticket id '{raw}'")))
}

fn parse_status(raw: &str) -> HubResult<TicketStatus> {
    TicketStatus::from_str(raw)
        .map_err(|_| HubError::BadArgument(format!("unknown ticket status '{raw}'")))
}

fn parse_priority(raw: &str) -> HubResult<TicketPriority> {
    TicketPriority::from_str(raw)
        .map_err(|_| HubError::BadArgument(format!("unknown ticket priority '{raw}'")))
}
