/*
Copyright 2024-2025 The Spice.ai OSS Authors

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use arrow::datatypes::Schema;
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tonic::{Response, Status};

use super::util::internal_error;
use super::Service;

type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;

/// One `FlightInfo` per unique template filename: empty schema, a descriptor
/// carrying `{template, metadata}`, and an endpoint pointing back at this
/// server.
pub(crate) fn handle(service: &Service) -> Result<Response<ListFlightsStream>, Status> {
    let location = service.runtime.config.location();
    let mut infos: Vec<Result<FlightInfo, Status>> = Vec::new();

    for metadata in service.runtime.templates.list() {
        let payload = serde_json::json!({
            "template": metadata.name,
            "metadata": &*metadata,
        });
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            continue;
        };

        let descriptor = FlightDescriptor::new_cmd(bytes.clone());
        let info = FlightInfo::new()
            .try_with_schema(&Schema::empty())
            .map_err(internal_error)?
            .with_descriptor(descriptor)
            .with_endpoint(
                FlightEndpoint::new()
                    .with_ticket(Ticket {
                        ticket: bytes.into(),
                    })
                    .with_location(location.clone()),
            )
            .with_total_records(-1)
            .with_total_bytes(-1);
        infos.push(Ok(info));
    }

    Ok(Response::new(stream::iter(infos).boxed()))
}
