use super::*;

#[test]
fn seeded_catalog_filters_unmounted_cocktails() {
    let machine = Machine::new(8);
    let names: Vec<String> = machine
        .available_cocktails()
        .into_iter()
        .map(|cocktail| cocktail.name)
        .collect();
    assert_eq!(names, ["Margarita", "Vodka Martini"]);
}

#[test]
fn bottles_report_their_slot() {
    let machine = Machine::new(8);
    let bottles = machine.bottles();
    let tequila = bottles.iter().find(|b| b.name == "Tequila").unwrap();
    let gin = bottles.iter().find(|b| b.name == "Gin").unwrap();
    assert_eq!(tequila.assigned_slot, Some(SlotId(2)));
    assert_eq!(gin.assigned_slot, None);
    assert_eq!(bottles[0].kind, "Liqueur");
}

#[test]
fn assigning_moves_a_bottle_between_slots() {
    let machine = Machine::new(8);
    let slots = machine
        .assign(&AssignSlotRequest {
            slot: SlotId(6),
            bottle_id: Some(BottleId(1)),
        })
        .unwrap();

    assert_eq!(slots.len(), SLOT_COUNT as usize);
    assert_eq!(slots[0].bottle_id, None);
    assert_eq!(slots[5].bottle_id, Some(BottleId(1)));
    assert_eq!(slots[5].name.as_deref(), Some("Vodka"));
}

#[test]
fn assigning_rejects_unknown_slot_or_bottle() {
    let machine = Machine::new(8);
    assert_eq!(
        machine.assign(&AssignSlotRequest {
            slot: SlotId(0),
            bottle_id: None,
        }),
        Err(MachineError::UnknownSlot(SlotId(0)))
    );
    assert_eq!(
        machine.assign(&AssignSlotRequest {
            slot: SlotId(1),
            bottle_id: Some(BottleId(42)),
        }),
        Err(MachineError::UnknownBottle(BottleId(42)))
    );
}

#[test]
fn pour_lifecycle_publishes_events_and_updates_status() {
    let machine = Machine::new(8);
    let mut events = machine.subscribe();

    let pour = machine.begin_pour(CocktailId(1)).expect("pour");
    assert_eq!(pour.drink, "Margarita");
    let status = machine.status();
    assert_eq!(status.status, MachineStatusKind::Busy);
    assert_eq!(status.current_operation.as_deref(), Some("Margarita"));
    assert!(status.start_time.is_some());

    assert_eq!(
        machine.begin_pour(CocktailId(2)),
        Err(MachineError::Busy("Margarita".to_string()))
    );

    machine.finish_pour(&pour, None);
    assert_eq!(machine.status(), StatusSnapshot::available(0));

    assert!(matches!(
        events.try_recv().unwrap(),
        ServerEvent::OperationStarted(ref started) if started.operation == "Margarita"
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        ServerEvent::OperationCompleted(ref done) if done.operation.as_deref() == Some("Margarita")
    ));
}

#[test]
fn failed_pour_reports_error() {
    let machine = Machine::new(8);
    let mut events = machine.subscribe();
    let pour = machine.begin_pour(CocktailId(2)).unwrap();

    machine.finish_pour(&pour, Some("valve stuck".to_string()));

    let _started = events.try_recv().unwrap();
    let ServerEvent::OperationFailed(failed) = events.try_recv().unwrap() else {
        panic!("expected operation_failed");
    };
    assert_eq!(failed.error.as_deref(), Some("valve stuck"));
    assert_eq!(
        failed.message.as_deref(),
        Some("Failed to prepare Vodka Martini: valve stuck")
    );
    assert_eq!(machine.status().status, MachineStatusKind::Available);
}

#[test]
fn unknown_or_unmounted_cocktails_cannot_pour() {
    let machine = Machine::new(8);
    assert_eq!(
        machine.begin_pour(CocktailId(99)),
        Err(MachineError::CocktailNotFound)
    );
    assert_eq!(
        machine.begin_pour(CocktailId(3)),
        Err(MachineError::NotPourable("Cuba Libre".to_string()))
    );
    assert_eq!(machine.status().status, MachineStatusKind::Available);
}

#[test]
fn client_count_tracks_connections() {
    let machine = Machine::new(8);
    assert_eq!(machine.client_connected().connected_clients, 1);
    assert_eq!(machine.client_connected().connected_clients, 2);
    machine.client_disconnected();
    machine.client_disconnected();
    machine.client_disconnected();
    assert_eq!(machine.status().connected_clients, 0);
}
